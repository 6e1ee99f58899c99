//! Mapping of provider hangup causes onto call results

use crate::store::CallResult;

/// Classify a hangup
///
/// `answered` reflects whether the callee picked up before the hangup; a
/// normal clearing then means the conversation ended, otherwise the phone
/// rang out.
pub fn classify_hangup(cause: Option<&str>, answered: bool) -> CallResult {
    let cause = cause.map(|c| c.trim().to_ascii_lowercase().replace(['-', ' '], "_"));
    match cause.as_deref() {
        Some("busy" | "user_busy" | "line_busy") => CallResult::Busy,
        Some(
            "no_answer" | "timeout" | "no_user_response" | "originator_cancel" | "ring_timeout" | "canceled",
        ) => CallResult::NoAnswer,
        Some(
            "failed" | "call_rejected" | "rejected" | "unallocated_number" | "invalid_number" | "network_error"
            | "error",
        ) => CallResult::Failed,
        Some("completed" | "normal_clearing" | "hangup") | None => {
            if answered {
                CallResult::Answered
            } else {
                CallResult::NoAnswer
            }
        }
        Some(_) if answered => CallResult::Answered,
        Some(_) => CallResult::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_and_no_answer_variants() {
        assert_eq!(classify_hangup(Some("USER_BUSY"), false), CallResult::Busy);
        assert_eq!(classify_hangup(Some("no-answer"), false), CallResult::NoAnswer);
        assert_eq!(classify_hangup(Some("call rejected"), false), CallResult::Failed);
    }

    #[test]
    fn test_normal_clearing_depends_on_answer() {
        assert_eq!(classify_hangup(Some("normal_clearing"), true), CallResult::Answered);
        assert_eq!(classify_hangup(Some("normal_clearing"), false), CallResult::NoAnswer);
        assert_eq!(classify_hangup(None, false), CallResult::NoAnswer);
    }

    #[test]
    fn test_unknown_cause() {
        assert_eq!(classify_hangup(Some("cosmic_rays"), false), CallResult::Failed);
        assert_eq!(classify_hangup(Some("cosmic_rays"), true), CallResult::Answered);
    }
}
