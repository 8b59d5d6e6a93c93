//! Condition bookkeeping and the Ready summarization.
//!
//! The summary is a pure reducer over the sub-condition set: Stalled wins,
//! then the worst negative-polarity condition, then a failed bi-polar
//! verification, and only a stored artifact with no reconciliation in
//! flight yields Ready=True. Anything else leaves Ready untouched.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

use source_operator_crd::condition;
use source_operator_crd::condition::reason;

const TRUE: &str = "True";
const FALSE: &str = "False";

/// A Ready status flip observed by one summarization pass; emitted as a
/// single event per reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyTransition {
    pub ready: bool,
    pub reason: String,
    pub message: String,
}

pub fn get<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|condition| condition.type_ == condition_type)
}

pub fn is_true(conditions: &[Condition], condition_type: &str) -> bool {
    get(conditions, condition_type).map(|condition| condition.status == TRUE) == Some(true)
}

pub fn is_false(conditions: &[Condition], condition_type: &str) -> bool {
    get(conditions, condition_type).map(|condition| condition.status == FALSE) == Some(true)
}

/// Upserts a condition. The transition time only moves when the status
/// flips, matching apimachinery semantics.
pub fn set(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: bool,
    reason: &str,
    message: &str,
    generation: i64,
) {
    let status = if status { TRUE } else { FALSE };
    match conditions
        .iter_mut()
        .find(|condition| condition.type_ == condition_type)
    {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Time(k8s_openapi::chrono::Utc::now());
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = Some(generation);
        }
        None => conditions.push(Condition {
            type_: condition_type.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: Some(generation),
            last_transition_time: Time(k8s_openapi::chrono::Utc::now()),
        }),
    }
}

pub fn remove(conditions: &mut Vec<Condition>, condition_type: &str) {
    conditions.retain(|condition| condition.type_ != condition_type);
}

/// Reduces the sub-condition set into Ready and returns the transition if
/// the Ready status changed.
pub fn summarize(conditions: &mut Vec<Condition>, generation: i64) -> Option<ReadyTransition> {
    let previous_ready = get(conditions, condition::READY)
        .map(|ready| ready.status == TRUE);

    // Stalled overrides everything; a stalled object is not reconciling.
    if is_true(conditions, condition::STALLED) {
        remove(conditions, condition::RECONCILING);
        let stalled = get(conditions, condition::STALLED).expect("checked above").clone();
        set(
            conditions,
            condition::READY,
            false,
            &stalled.reason,
            &stalled.message,
            generation,
        );
        return transition(conditions, previous_ready);
    }

    // The worst negative sub-condition wins; an active Reconciling
    // condition is downgraded to a retry to make the backoff visible.
    for negative in condition::NEGATIVE_CONDITIONS {
        if is_true(conditions, negative) {
            let failed = get(conditions, negative).expect("checked above").clone();
            if let Some(reconciling) = conditions
                .iter_mut()
                .find(|condition| condition.type_ == condition::RECONCILING)
            {
                reconciling.reason = reason::PROGRESSING_WITH_RETRY.to_string();
            }
            set(
                conditions,
                condition::READY,
                false,
                &failed.reason,
                &failed.message,
                generation,
            );
            return transition(conditions, previous_ready);
        }
    }

    // A failed bi-polar verification blocks readiness on its own.
    if is_false(conditions, condition::SOURCE_VERIFIED) {
        let verification = get(conditions, condition::SOURCE_VERIFIED)
            .expect("checked above")
            .clone();
        set(
            conditions,
            condition::READY,
            false,
            &verification.reason,
            &verification.message,
            generation,
        );
        return transition(conditions, previous_ready);
    }

    if is_true(conditions, condition::ARTIFACT_IN_STORAGE)
        && !is_true(conditions, condition::RECONCILING)
    {
        let stored = get(conditions, condition::ARTIFACT_IN_STORAGE)
            .expect("checked above")
            .clone();
        set(
            conditions,
            condition::READY,
            true,
            &stored.reason,
            &stored.message,
            generation,
        );
        return transition(conditions, previous_ready);
    }

    // No verdict this pass: Ready keeps its previous state.
    None
}

fn transition(conditions: &[Condition], previous_ready: Option<bool>) -> Option<ReadyTransition> {
    let ready = get(conditions, condition::READY)?;
    let now_ready = ready.status == TRUE;
    if previous_ready == Some(now_ready) {
        return None;
    }
    Some(ReadyTransition {
        ready: now_ready,
        reason: ready.reason.clone(),
        message: ready.message.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_of(conditions: &[Condition]) -> &Condition {
        get(conditions, condition::READY).expect("Ready present")
    }

    #[test]
    fn stalled_wins_and_clears_reconciling() {
        let mut conditions = Vec::new();
        set(
            &mut conditions,
            condition::RECONCILING,
            true,
            reason::PROGRESSING,
            "building",
            1,
        );
        set(
            &mut conditions,
            condition::STALLED,
            true,
            reason::VERIFICATION_ERROR,
            "no matching key",
            1,
        );
        set(
            &mut conditions,
            condition::ARTIFACT_IN_STORAGE,
            true,
            reason::SUCCEEDED,
            "stored",
            1,
        );

        let transition = summarize(&mut conditions, 1).expect("ready transitions");
        assert!(!transition.ready);
        assert_eq!(transition.reason, reason::VERIFICATION_ERROR);
        assert!(get(&conditions, condition::RECONCILING).is_none());
        assert_eq!(ready_of(&conditions).status, "False");
    }

    #[test]
    fn negative_conditions_rank_by_severity() {
        let mut conditions = Vec::new();
        set(
            &mut conditions,
            condition::FETCH_FAILED,
            true,
            reason::FAILED,
            "registry unreachable",
            1,
        );
        set(
            &mut conditions,
            condition::STORAGE_OPERATION_FAILED,
            true,
            reason::STORAGE_OPERATION_FAILED,
            "disk full",
            1,
        );

        summarize(&mut conditions, 1);
        // StorageOperationFailed outranks FetchFailed.
        assert_eq!(ready_of(&conditions).reason, reason::STORAGE_OPERATION_FAILED);
    }

    #[test]
    fn outdated_artifact_alone_blocks_readiness() {
        let mut conditions = Vec::new();
        set(
            &mut conditions,
            condition::ARTIFACT_IN_STORAGE,
            true,
            reason::SUCCEEDED,
            "stored",
            1,
        );
        set(
            &mut conditions,
            condition::ARTIFACT_OUTDATED,
            true,
            reason::NEW_ARTIFACT,
            "new upstream revision 'r2' supersedes stored revision 'r1'",
            1,
        );

        summarize(&mut conditions, 1);
        let ready = ready_of(&conditions);
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, reason::NEW_ARTIFACT);
    }

    #[test]
    fn retrying_reconciliation_is_marked() {
        let mut conditions = Vec::new();
        set(
            &mut conditions,
            condition::RECONCILING,
            true,
            reason::PROGRESSING,
            "building",
            1,
        );
        set(
            &mut conditions,
            condition::BUILD_FAILED,
            true,
            reason::FAILED,
            "values merge failed",
            1,
        );

        summarize(&mut conditions, 1);
        assert_eq!(
            get(&conditions, condition::RECONCILING).unwrap().reason,
            reason::PROGRESSING_WITH_RETRY
        );
    }

    #[test]
    fn failed_verification_blocks_readiness() {
        let mut conditions = Vec::new();
        set(
            &mut conditions,
            condition::ARTIFACT_IN_STORAGE,
            true,
            reason::SUCCEEDED,
            "stored",
            1,
        );
        set(
            &mut conditions,
            condition::SOURCE_VERIFIED,
            false,
            reason::VERIFICATION_ERROR,
            "signature mismatch",
            1,
        );

        summarize(&mut conditions, 1);
        let ready = ready_of(&conditions);
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, reason::VERIFICATION_ERROR);
    }

    #[test]
    fn stored_artifact_with_idle_reconciler_is_ready() {
        let mut conditions = Vec::new();
        set(
            &mut conditions,
            condition::ARTIFACT_IN_STORAGE,
            true,
            reason::SUCCEEDED,
            "stored artifact for revision 6.2.0",
            2,
        );
        set(
            &mut conditions,
            condition::SOURCE_VERIFIED,
            true,
            reason::SUCCEEDED,
            "verified",
            2,
        );

        let transition = summarize(&mut conditions, 2).expect("ready transitions");
        assert!(transition.ready);
        assert_eq!(ready_of(&conditions).status, "True");
        assert_eq!(
            ready_of(&conditions).observed_generation,
            Some(2)
        );
    }

    #[test]
    fn active_reconciling_withholds_readiness() {
        let mut conditions = Vec::new();
        set(
            &mut conditions,
            condition::ARTIFACT_IN_STORAGE,
            true,
            reason::SUCCEEDED,
            "stored",
            1,
        );
        set(
            &mut conditions,
            condition::RECONCILING,
            true,
            reason::PROGRESSING,
            "new revision observed",
            1,
        );

        assert_eq!(summarize(&mut conditions, 1), None);
        assert!(get(&conditions, condition::READY).is_none());
    }

    #[test]
    fn unchanged_ready_state_emits_no_transition() {
        let mut conditions = Vec::new();
        set(
            &mut conditions,
            condition::ARTIFACT_IN_STORAGE,
            true,
            reason::SUCCEEDED,
            "stored",
            1,
        );
        assert!(summarize(&mut conditions, 1).is_some());
        // Second pass with identical inputs: same Ready state, no event.
        assert!(summarize(&mut conditions, 1).is_none());
    }

    #[test]
    fn transition_time_moves_only_on_status_flips() {
        let mut conditions = Vec::new();
        set(
            &mut conditions,
            condition::FETCH_FAILED,
            true,
            reason::FAILED,
            "first failure",
            1,
        );
        let first = get(&conditions, condition::FETCH_FAILED)
            .unwrap()
            .last_transition_time
            .clone();

        std::thread::sleep(std::time::Duration::from_millis(5));
        set(
            &mut conditions,
            condition::FETCH_FAILED,
            true,
            reason::FAILED,
            "second failure",
            1,
        );
        assert_eq!(
            get(&conditions, condition::FETCH_FAILED)
                .unwrap()
                .last_transition_time,
            first
        );
    }
}
