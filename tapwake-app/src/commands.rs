//! Interactive commands read from stdin while the alarm loop runs.
//!
//! ```text
//! on | off        enable / disable the alarm
//! set HH:MM       replace the trigger time (clears the re-fire latch)
//! status          print the current state
//! quit | exit     stop and leave
//! ```
//!
//! There is no command that silences a ringing, enabled alarm. Only running
//! water does that, or `off`, which disables it.

use chrono::NaiveTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Enable,
    Disable,
    Set(NaiveTime),
    Status,
    Quit,
    Help,
}

pub const HELP: &str = "commands: on | off | set HH:MM | status | quit";

/// Parse `HH:MM` (24 h). Also used as the clap value parser for `--at`.
pub fn parse_hhmm(value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| format!("expected HH:MM (24 h), got `{}`", value.trim()))
}

pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut parts = line.split_whitespace();
    let Some(head) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(format!("too many arguments: {}", line.trim()));
    }

    let command = match (head.to_ascii_lowercase().as_str(), arg) {
        ("on" | "enable", None) => Command::Enable,
        ("off" | "disable", None) => Command::Disable,
        ("set", Some(time)) => Command::Set(parse_hhmm(time)?),
        ("set", None) => return Err("usage: set HH:MM".into()),
        ("status", None) => Command::Status,
        ("quit" | "exit" | "q", None) => Command::Quit,
        ("help" | "?", None) => Command::Help,
        (other, _) => return Err(format!("unknown command `{other}`. {HELP}")),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn parses_every_command() {
        assert_eq!(parse_command("on"), Ok(Some(Command::Enable)));
        assert_eq!(parse_command("OFF"), Ok(Some(Command::Disable)));
        assert_eq!(
            parse_command("set 06:05"),
            Ok(Some(Command::Set(
                NaiveTime::from_hms_opt(6, 5, 0).expect("valid time")
            )))
        );
        assert_eq!(parse_command(" status "), Ok(Some(Command::Status)));
        assert_eq!(parse_command("exit"), Ok(Some(Command::Quit)));
        assert_eq!(parse_command("?"), Ok(Some(Command::Help)));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_command("set").is_err());
        assert!(parse_command("set 25:00").is_err());
        assert!(parse_command("set 7").is_err());
        assert!(parse_command("on now").is_err());
        assert!(parse_command("snooze").is_err());
    }

    #[test]
    fn nothing_silences_a_ringing_alarm_but_off() {
        for word in ["stop", "dismiss", "silence", "snooze"] {
            let err = parse_command(word).expect_err(word);
            assert!(err.contains("unknown command"), "{word}: {err}");
        }
        assert!(!HELP.contains("stop"));
    }

    #[test]
    fn hhmm_accepts_single_digit_hour() {
        assert_eq!(
            parse_hhmm("7:30"),
            Ok(NaiveTime::from_hms_opt(7, 30, 0).expect("valid time"))
        );
        assert!(parse_hhmm("07:30:15").is_err());
    }
}
