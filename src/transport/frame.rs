use serde_json::Value;

/// Wire form of a heartbeat frame
pub const HEARTBEAT: &str = "0";

const EVENT_MARKER: char = '1';

/// A decoded inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Heartbeat,
    Event { name: String, args: Vec<Value> },
}

impl Frame {
    /// Parse a text frame. Anything that is not a heartbeat or a well formed
    /// event frame yields `None`.
    pub fn parse(text: &str) -> Option<Frame> {
        let mut chars = text.chars();
        match chars.next()? {
            '0' => Some(Frame::Heartbeat),
            EVENT_MARKER => {
                let mut items: Vec<Value> = serde_json::from_str(chars.as_str()).ok()?;
                if items.is_empty() {
                    return None;
                }
                let name = match items.remove(0) {
                    Value::String(name) => name,
                    _ => return None,
                };
                Some(Frame::Event { name, args: items })
            }
            _ => None,
        }
    }

    /// Encode an event name and its positional arguments as one frame
    pub fn encode_event(name: &str, args: &[Value]) -> Result<String, serde_json::Error> {
        let mut items = Vec::with_capacity(args.len() + 1);
        items.push(Value::String(name.to_string()));
        items.extend_from_slice(args);
        Ok(format!("{}{}", EVENT_MARKER, serde_json::to_string(&items)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_heartbeat() {
        assert_eq!(Frame::parse("0"), Some(Frame::Heartbeat));
    }

    #[test]
    fn test_parse_event_with_args() {
        let frame = Frame::parse(r#"1["player_position","spotify","abc",12]"#).unwrap();
        assert_eq!(
            frame,
            Frame::Event {
                name: "player_position".into(),
                args: vec![json!("spotify"), json!("abc"), json!(12)],
            }
        );
    }

    #[test]
    fn test_parse_malformed_frames() {
        assert_eq!(Frame::parse(""), None);
        assert_eq!(Frame::parse("2whatever"), None);
        assert_eq!(Frame::parse("1{not json"), None);
        assert_eq!(Frame::parse("1[]"), None);
        assert_eq!(Frame::parse("1[42]"), None);
    }

    #[test]
    fn test_encode_event() {
        let text = Frame::encode_event("get_stream", &[json!("123")]).unwrap();
        assert_eq!(text, r#"1["get_stream","123"]"#);
        assert_eq!(Frame::encode_event("fetch_auth_token", &[]).unwrap(), r#"1["fetch_auth_token"]"#);
    }
}
