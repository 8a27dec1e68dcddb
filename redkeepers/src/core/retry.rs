//! Retry bookkeeping and escalation at the retry threshold.

use crate::core::queue::{
    Queue, QueueError, RETRY_THRESHOLD_CATEGORY, RETRY_THRESHOLD_REASON, create_escalation_item,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back in the queue for another attempt.
    Requeued { retry_count: u32 },
    /// Threshold crossed: the item is blocked and an escalation exists.
    Escalated {
        retry_count: u32,
        escalation_id: Option<String>,
    },
}

/// Record a retryable failure for `id`.
///
/// Once `retry_count` exceeds `max_retries`, the item is blocked with the
/// threshold reason and a `{id}-ESC` follow-up is appended for the lead.
/// Escalation items themselves are blocked without spawning another level.
pub fn apply_retry(
    queue: &mut Queue,
    id: &str,
    reason: &str,
    max_retries: u32,
    lead_agent: &str,
    now: &str,
) -> Result<RetryDecision, QueueError> {
    let retry_count = queue.increment_retry(id, reason, now)?;
    if retry_count <= max_retries {
        return Ok(RetryDecision::Requeued { retry_count });
    }

    let source = queue
        .find(id)
        .cloned()
        .ok_or_else(|| QueueError::UnknownItem(id.to_string()))?;
    let escalation_id = if source.is_escalation() {
        None
    } else {
        let escalation = create_escalation_item(&source, lead_agent, reason, now);
        let escalation_id = escalation.id.clone();
        queue.append_item(escalation);
        Some(escalation_id)
    };
    queue.mark_blocked(id, RETRY_THRESHOLD_REASON, Some(RETRY_THRESHOLD_CATEGORY), now)?;
    Ok(RetryDecision::Escalated {
        retry_count,
        escalation_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ItemStatus;
    use crate::test_support::{T1, queued};

    #[test]
    fn escalates_after_threshold_exactly_once() {
        let mut queue = Queue::new(vec![queued("A")], Vec::new(), Vec::new());
        for expected in 1..=2 {
            let decision = apply_retry(&mut queue, "A", "tests failed", 2, "lead-1", T1).expect("retry");
            assert_eq!(decision, RetryDecision::Requeued { retry_count: expected });
        }
        let decision = apply_retry(&mut queue, "A", "tests failed", 2, "lead-1", T1).expect("retry");
        assert_eq!(
            decision,
            RetryDecision::Escalated {
                retry_count: 3,
                escalation_id: Some("A-ESC".to_string())
            }
        );

        let escalations: Vec<_> = queue.active.iter().filter(|i| i.id == "A-ESC").collect();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].preferred_agent.as_deref(), Some("lead-1"));
        let blocked = queue.find("A").expect("source");
        assert_eq!(blocked.status, ItemStatus::Blocked);
        assert_eq!(blocked.blocker_reason.as_deref(), Some(RETRY_THRESHOLD_REASON));
        assert_eq!(blocked.retry_count, 3);
    }

    #[test]
    fn escalation_items_do_not_chain() {
        let mut queue = Queue::new(vec![queued("A-ESC")], Vec::new(), Vec::new());
        let decision = apply_retry(&mut queue, "A-ESC", "still failing", 0, "lead-1", T1).expect("retry");
        assert_eq!(
            decision,
            RetryDecision::Escalated {
                retry_count: 1,
                escalation_id: None
            }
        );
        assert!(queue.active.is_empty());
    }
}
