//! Direction classification relative to the watched mailbox.

use crate::accounts::normalize_email;
use crate::error::ClassificationError;
use crate::interactions::Direction;

/// Decide whether a message was sent or received by the watched mailbox.
///
/// Sender match wins, so a note-to-self counts as outgoing.
pub fn classify(
    from: &str,
    to: &[String],
    cc: &[String],
    watched: &str,
) -> Result<Direction, ClassificationError> {
    let watched_norm = normalize_email(watched);

    if normalize_email(from) == watched_norm {
        return Ok(Direction::Outgoing);
    }
    if to
        .iter()
        .chain(cc.iter())
        .any(|addr| normalize_email(addr) == watched_norm)
    {
        return Ok(Direction::Incoming);
    }

    Err(ClassificationError::WatchedAddressAbsent {
        watched: watched_norm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sender_is_watched_means_outgoing() {
        let direction = classify(
            " Sales@Us.com",
            &list(&["buyer@acme.com"]),
            &[],
            "sales@us.com",
        );
        assert_eq!(direction, Ok(Direction::Outgoing));
    }

    #[test]
    fn watched_in_to_or_cc_means_incoming() {
        assert_eq!(
            classify("buyer@acme.com", &list(&["SALES@us.com"]), &[], "sales@us.com"),
            Ok(Direction::Incoming)
        );
        assert_eq!(
            classify(
                "buyer@acme.com",
                &list(&["other@us.com"]),
                &list(&["Sales Desk <sales@us.com>"]),
                "sales@us.com"
            ),
            Ok(Direction::Incoming)
        );
    }

    #[test]
    fn self_addressed_is_outgoing() {
        assert_eq!(
            classify("sales@us.com", &list(&["sales@us.com"]), &[], "sales@us.com"),
            Ok(Direction::Outgoing)
        );
    }

    #[test]
    fn absent_watched_address_is_an_error() {
        let err = classify("a@x.com", &list(&["b@x.com"]), &list(&["c@x.com"]), "Sales@Us.com")
            .unwrap_err();
        assert_eq!(
            err,
            ClassificationError::WatchedAddressAbsent {
                watched: "sales@us.com".into()
            }
        );
    }
}
