//! Lobby notification parsing.
//!
//! The lobby service pushes notifications as newline separated `key: value`
//! lines. The only notification the load driver acts on is `connectNotif`,
//! which carries the lobby session ID assigned to the connection.

/// The notification type that carries a lobby session ID.
pub const CONNECT_NOTIF: &str = "connectNotif";

const TYPE_KEY: &str = "type";
const LOBBY_SESSION_ID_KEY: &str = "lobbySessionID";

/// The fields of a lobby notification the driver cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Notification<'a> {
    kind: Option<&'a str>,
    lobby_session_id: Option<&'a str>,
}

impl<'a> Notification<'a> {
    /// Parse a raw notification.
    ///
    /// Each line is split on its first `:`. Lines with no `:` or with a blank
    /// key are skipped. When a key repeats, the last line wins.
    #[must_use]
    pub fn parse(message: &'a str) -> Self {
        let mut notification = Self::default();

        for line in message.split('\n') {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim();

            match key {
                TYPE_KEY => notification.kind = Some(value),
                LOBBY_SESSION_ID_KEY => notification.lobby_session_id = Some(value),
                _ => {}
            }
        }

        notification
    }

    /// The value of the last `type` line, if any.
    #[must_use]
    pub fn kind(&self) -> Option<&'a str> {
        self.kind
    }

    /// The lobby session ID, only if this is a `connectNotif` and the ID is
    /// not blank.
    #[must_use]
    pub fn lobby_session_id(&self) -> Option<&'a str> {
        if self.kind != Some(CONNECT_NOTIF) {
            return None;
        }
        self.lobby_session_id.filter(|id| !id.is_empty())
    }
}

/// Extract the lobby session ID from a raw notification, if it carries one.
#[must_use]
pub fn lobby_session_id(message: &str) -> Option<&str> {
    Notification::parse(message).lobby_session_id()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn connect_notif_yields_session_id() {
        assert_eq!(
            lobby_session_id("type:connectNotif\nlobbySessionID: abc123\n"),
            Some("abc123")
        );
    }

    #[test]
    fn other_type_yields_nothing() {
        assert_eq!(
            lobby_session_id("type:otherEvent\nlobbySessionID: abc123\n"),
            None
        );
    }

    #[test]
    fn last_type_line_decides() {
        let message = "foo\ntype: connectNotif\nlobbySessionID:xyz\ntype:heartbeat\n";
        assert_eq!(lobby_session_id(message), None);
        assert_eq!(Notification::parse(message).kind(), Some("heartbeat"));
    }

    #[test]
    fn session_id_before_type_is_accepted() {
        assert_eq!(
            lobby_session_id("lobbySessionID: early\ntype: connectNotif"),
            Some("early")
        );
    }

    #[test]
    fn value_keeps_inner_colons() {
        assert_eq!(
            lobby_session_id("type: connectNotif\nlobbySessionID: a:b:c \r\n"),
            Some("a:b:c")
        );
    }

    #[test]
    fn blank_session_id_is_none() {
        assert_eq!(lobby_session_id("type: connectNotif\nlobbySessionID:  \n"), None);
    }

    #[test]
    fn type_is_case_sensitive() {
        assert_eq!(
            lobby_session_id("type: ConnectNotif\nlobbySessionID: abc\n"),
            None
        );
        assert_eq!(
            lobby_session_id("Type: connectNotif\nlobbySessionID: abc\n"),
            None
        );
    }

    #[test]
    fn empty_message() {
        assert_eq!(Notification::parse(""), Notification::default());
    }

    fn noise_line() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-zA-Z0-9 ]{0,12}",
            " *:[a-z0-9 ]{0,8}",
        ]
    }

    proptest! {
        #[test]
        fn last_session_id_wins(
            ids in prop::collection::vec("[A-Za-z0-9-]{1,16}", 1..4),
            noise in prop::collection::vec(noise_line(), 0..6),
        ) {
            let mut lines = noise;
            for id in &ids {
                lines.push(format!("lobbySessionID:  {id}  "));
            }
            lines.push("type: connectNotif".to_string());
            let message = lines.join("\n");

            prop_assert_eq!(lobby_session_id(&message), ids.last().map(String::as_str));
        }

        #[test]
        fn no_type_line_means_no_session_id(
            id in "[A-Za-z0-9-]{1,16}",
            noise in prop::collection::vec(noise_line(), 0..6),
        ) {
            let mut lines = noise;
            lines.push(format!("lobbySessionID: {id}"));
            let message = lines.join("\n");

            prop_assert_eq!(lobby_session_id(&message), None);
        }

        #[test]
        fn malformed_lines_do_not_disturb_extraction(
            id in "[A-Za-z0-9-]{1,16}",
            noise in prop::collection::vec(noise_line(), 0..6),
        ) {
            let mut lines = vec!["type: connectNotif".to_string(), format!("lobbySessionID: {id}")];
            lines.extend(noise);
            let message = lines.join("\n");

            prop_assert_eq!(lobby_session_id(&message), Some(id.as_str()));
        }
    }
}
