//! The `!ping` command: tells a user how long their message took to arrive.

use chrono::TimeDelta;
use serde_json::json;

use super::HTML_FORMAT;

/// Prefix of the ping command.
pub const PING_COMMAND: &str = "!ping";

/// Longest argument echoed back in a reply.
const MAX_ARGUMENT_LENGTH: usize = 32;

/// Builds the content of the reply to a `!ping` command.
///
/// `body` is the full command text, `delay` the time between the event's
/// `origin_server_ts` and its local reception.
pub fn ping_reply(
    message_type: &str,
    sender: &str,
    room_id: &str,
    event_id: &str,
    body: &str,
    delay: TimeDelta,
) -> serde_json::Value {
    let message = match body.split_once(' ').map(|(_, rest)| rest.trim()) {
        Some(arg) if !arg.is_empty() => {
            let arg: String = arg.chars().take(MAX_ARGUMENT_LENGTH).collect();
            format!("\"{}\" took", arg)
        }
        _ => "took".to_string(),
    };
    let duration = format_duration(delay);

    let plain = format!(
        "{}: Pong! (ping {} {} to arrive)",
        sender, message, duration
    );
    let formatted = format!(
        "<a href='https://matrix.to/#/{sender}'>{sender}</a>: Pong! \
         (<a href='https://matrix.to/#/{room}/{event}'>ping</a> {message} {duration} to arrive)",
        sender = escape_html(sender),
        room = escape_html(room_id),
        event = escape_html(event_id),
        message = escape_html(&message),
        duration = duration,
    );

    json!({
        "msgtype": message_type,
        "body": plain,
        "format": HTML_FORMAT,
        "formatted_body": formatted,
        "pong": {
            "ms": delay.num_milliseconds(),
            "from": homeserver_of(sender),
            "ping": event_id,
        },
    })
}

/// Formats a delay for humans: milliseconds below ten seconds, tenths of a
/// second below a minute, whole seconds above.
pub fn format_duration(d: TimeDelta) -> String {
    if d < TimeDelta::seconds(10) {
        format!("{} ms", d.num_milliseconds())
    } else if d < TimeDelta::minutes(1) {
        format!("{:.1} second", d.num_milliseconds() as f64 / 1000.0)
    } else {
        let total = d.num_seconds();
        let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
        if hours > 0 {
            format!("{}h{}m{}s", hours, minutes, seconds)
        } else {
            format!("{}m{}s", minutes, seconds)
        }
    }
}

/// Server part of a user id (`@user:server`).
fn homeserver_of(user_id: &str) -> &str {
    user_id.split_once(':').map(|(_, server)| server).unwrap_or("")
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(TimeDelta::milliseconds(250)), "250 ms");
        assert_eq!(format_duration(TimeDelta::milliseconds(9_999)), "9999 ms");
        assert_eq!(format_duration(TimeDelta::milliseconds(12_340)), "12.3 second");
        assert_eq!(format_duration(TimeDelta::seconds(90)), "1m30s");
        assert_eq!(format_duration(TimeDelta::seconds(3_725)), "1h2m5s");
    }

    #[test]
    fn test_ping_reply_without_argument() {
        let reply = ping_reply(
            "m.notice",
            "@alice:example.org",
            "!room:example.org",
            "$event",
            "!ping",
            TimeDelta::milliseconds(420),
        );

        assert_eq!(
            reply["body"],
            "@alice:example.org: Pong! (ping took 420 ms to arrive)"
        );
        assert_eq!(reply["msgtype"], "m.notice");
        assert_eq!(reply["pong"]["ms"], 420);
        assert_eq!(reply["pong"]["from"], "example.org");
        assert_eq!(reply["pong"]["ping"], "$event");
    }

    #[test]
    fn test_ping_reply_truncates_argument() {
        let long = "x".repeat(50);
        let reply = ping_reply(
            "m.notice",
            "@alice:example.org",
            "!room:example.org",
            "$event",
            &format!("!ping {}", long),
            TimeDelta::milliseconds(5),
        );

        let expected = format!(
            "@alice:example.org: Pong! (ping \"{}\" took 5 ms to arrive)",
            "x".repeat(32)
        );
        assert_eq!(reply["body"], expected.as_str());
    }

    #[test]
    fn test_ping_reply_escapes_html() {
        let reply = ping_reply(
            "m.notice",
            "@alice:example.org",
            "!room:example.org",
            "$event",
            "!ping <b>hi</b>",
            TimeDelta::milliseconds(5),
        );
        let formatted = reply["formatted_body"].as_str().unwrap();
        assert!(formatted.contains("&lt;b&gt;hi&lt;/b&gt;"));
        assert!(!formatted.contains("<b>"));
    }
}
