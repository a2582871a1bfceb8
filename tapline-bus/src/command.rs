//! Translation of raw user input into outbound actions.
//!
//! The presentation layer handles its own navigation commands (help, open,
//! close, ...) and hands everything else to [`Action::parse`]:
//!
//! | input | open conversation | action |
//! |-------|-------------------|--------|
//! | `create <title>[: a, b]` | none | create conversation |
//! | `invite a, b` | `c` | invite into `c` |
//! | any other text | `c` | message in `c` |

use crate::protocol::Event;

/// A user-authored action, one per outbound tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateConversation {
        title: String,
        participants: Vec<String>,
    },
    Message {
        conversation: String,
        body: String,
    },
    Invite {
        conversation: String,
        invitees: Vec<String>,
    },
}

impl Action {
    /// Parse one line of input. Returns `None` for input that maps to no tap.
    pub fn parse(line: &str, open_conversation: Option<&str>) -> Option<Action> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (cmd, rest) = match line.split_once(' ') {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        match open_conversation {
            None => {
                if cmd != "create" {
                    return None;
                }
                let (title, participants) = match rest.split_once(':') {
                    Some((title, list)) => (title.trim(), split_names(list)),
                    None => (rest, Vec::new()),
                };
                if title.is_empty() {
                    return None;
                }
                Some(Action::CreateConversation {
                    title: title.to_string(),
                    participants,
                })
            }
            Some(conversation) if cmd == "invite" => {
                let invitees = split_names(rest);
                if invitees.is_empty() {
                    return None;
                }
                Some(Action::Invite {
                    conversation: conversation.to_string(),
                    invitees,
                })
            }
            Some(conversation) => Some(Action::Message {
                conversation: conversation.to_string(),
                body: line.to_string(),
            }),
        }
    }

    /// Build the outbound tap. The server restamps `user` on receipt.
    pub fn into_event(self, user: &str) -> Event {
        match self {
            Action::CreateConversation {
                title,
                participants,
            } => Event::create_conversation(user, title, "", participants),
            Action::Message { conversation, body } => Event::message(user, conversation, body),
            Action::Invite {
                conversation,
                invitees,
            } => Event::invite(user, conversation, invitees),
        }
    }
}

/// Comma-separated names, trimmed, empties dropped.
fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventKind;

    #[test]
    fn test_parse_create_with_participants() {
        let action = Action::parse("create Good Apples: John Apple, Fred Pear ,Bob", None).unwrap();
        assert_eq!(
            action,
            Action::CreateConversation {
                title: "Good Apples".into(),
                participants: vec!["John Apple".into(), "Fred Pear".into(), "Bob".into()],
            }
        );
    }

    #[test]
    fn test_parse_create_alone() {
        let action = Action::parse("create solo", None).unwrap();
        assert_eq!(
            action,
            Action::CreateConversation {
                title: "solo".into(),
                participants: vec![],
            }
        );
        assert!(Action::parse("create", None).is_none());
        assert!(Action::parse("create : alex", None).is_none());
    }

    #[test]
    fn test_parse_outside_conversation_ignores_text() {
        assert!(Action::parse("hello there", None).is_none());
        assert!(Action::parse("invite alex", None).is_none());
        assert!(Action::parse("   ", Some("c")).is_none());
    }

    #[test]
    fn test_parse_invite() {
        let action = Action::parse("invite alex, will,", Some("apples")).unwrap();
        assert_eq!(
            action,
            Action::Invite {
                conversation: "apples".into(),
                invitees: vec!["alex".into(), "will".into()],
            }
        );
        assert!(Action::parse("invite", Some("apples")).is_none());
    }

    #[test]
    fn test_parse_message_keeps_whole_line() {
        let action = Action::parse("create is just a word here", Some("apples")).unwrap();
        assert_eq!(
            action,
            Action::Message {
                conversation: "apples".into(),
                body: "create is just a word here".into(),
            }
        );
    }

    #[test]
    fn test_into_event() {
        let event = Action::Invite {
            conversation: "apples".into(),
            invitees: vec!["alex".into()],
        }
        .into_event("john");
        assert_eq!(event.kind, EventKind::Invite);
        assert_eq!(event.user, "john");
        assert_eq!(event.conversation, "apples");
        assert_eq!(event.args, vec!["alex".to_string()]);

        let event = Action::CreateConversation {
            title: "c".into(),
            participants: vec![],
        }
        .into_event("sean");
        assert_eq!(event.kind, EventKind::CreateConversation);
        assert!(event.value.is_empty());
    }
}
