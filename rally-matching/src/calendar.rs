//! Calendar exports for scheduled sessions: an iCalendar file and a
//! Google Calendar "add event" link.

use chrono::{DateTime, Duration, Utc};

use crate::models::MatchProposal;

pub const DEFAULT_SESSION_MINUTES: i64 = 60;
pub const GOOGLE_CALENDAR_RENDER_URL: &str = "https://calendar.google.com/calendar/render";

const PRODID: &str = "-//Rally//Sessions//EN";
const ICS_LINE_LIMIT: usize = 75;

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub uid: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    /// `start` plus [`DEFAULT_SESSION_MINUTES`] when unset.
    pub end: Option<DateTime<Utc>>,
}

impl CalendarEvent {
    pub fn new(title: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            uid: None,
            title: title.into(),
            description: None,
            location: None,
            start,
            end: None,
        }
    }

    pub fn for_proposal(proposal: &MatchProposal) -> Self {
        let title = match &proposal.court_name {
            Some(court) => format!("Tennis at {court}"),
            None => "Tennis session".to_string(),
        };
        Self {
            uid: Some(format!("{}@rally", proposal.id)),
            description: Some("Session scheduled with your Rally match".to_string()),
            location: proposal.court_name.clone(),
            ..Self::new(title, proposal.scheduled_at)
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
            .unwrap_or_else(|| self.start + Duration::minutes(DEFAULT_SESSION_MINUTES))
    }

    /// Title with whitespace runs turned into `_`, plus `.ics`. Only ASCII
    /// letters, digits and `-` survive so the name fits a header.
    pub fn file_name(&self) -> String {
        let stem: String = self
            .title
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if stem.is_empty() {
            return "session.ics".to_string();
        }
        format!("{stem}.ics")
    }

    pub fn to_ics(&self) -> String {
        let mut lines = vec![
            "BEGIN:VCALENDAR".to_string(),
            "VERSION:2.0".to_string(),
            format!("PRODID:{PRODID}"),
            "BEGIN:VEVENT".to_string(),
        ];
        if let Some(uid) = &self.uid {
            lines.push(format!("UID:{}", escape_text(uid)));
        }
        lines.push(format!("DTSTAMP:{}", utc_stamp(self.start)));
        lines.push(format!("DTSTART:{}", utc_stamp(self.start)));
        lines.push(format!("DTEND:{}", utc_stamp(self.end())));
        lines.push(format!("SUMMARY:{}", escape_text(&self.title)));
        lines.push(format!("DESCRIPTION:{}", escape_text(self.description.as_deref().unwrap_or(""))));
        lines.push(format!("LOCATION:{}", escape_text(self.location.as_deref().unwrap_or(""))));
        lines.push("END:VEVENT".to_string());
        lines.push("END:VCALENDAR".to_string());

        let mut ics = String::new();
        for line in &lines {
            fold_line(line, &mut ics);
        }
        ics
    }

    pub fn google_calendar_url(&self) -> String {
        let dates = format!("{}/{}", utc_stamp(self.start), utc_stamp(self.end()));
        let params = [
            ("action", "TEMPLATE"),
            ("text", self.title.as_str()),
            ("details", self.description.as_deref().unwrap_or("")),
            ("location", self.location.as_deref().unwrap_or("")),
            ("dates", dates.as_str()),
        ];
        let query = params
            .iter()
            .map(|(key, value)| format!("{key}={}", form_encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{GOOGLE_CALENDAR_RENDER_URL}?{query}")
    }
}

/// `20250301T170000Z`, whole seconds.
fn utc_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

/// Appends `line` with CRLF endings, continuing past 75 octets on lines
/// that start with a space. Never splits a character.
fn fold_line(line: &str, out: &mut String) {
    let mut used = 0;
    for c in line.chars() {
        if used + c.len_utf8() > ICS_LINE_LIMIT {
            out.push_str("\r\n ");
            used = 1;
        }
        out.push(c);
        used += c.len_utf8();
    }
    out.push_str("\r\n");
}

/// `application/x-www-form-urlencoded`, as browsers build query strings.
fn form_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'*' | b'-' | b'.' | b'_' => out.push(byte as char),
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProposalStatus;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn proposal(court: Option<&str>) -> MatchProposal {
        MatchProposal {
            id: Uuid::nil(),
            match_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            scheduled_at: Utc.with_ymd_and_hms(2025, 3, 1, 17, 0, 0).unwrap(),
            court_name: court.map(str::to_string),
            status: ProposalStatus::Accepted,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn session_lasts_an_hour_unless_told_otherwise() {
        let mut event = CalendarEvent::for_proposal(&proposal(None));
        assert_eq!(event.end(), Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap());

        event.end = Some(Utc.with_ymd_and_hms(2025, 3, 1, 19, 30, 0).unwrap());
        assert!(event.to_ics().contains("DTEND:20250301T193000Z\r\n"));
    }

    #[test]
    fn ics_holds_one_event() {
        let ics = CalendarEvent::for_proposal(&proposal(Some("Court 3"))).to_ics();
        let lines: Vec<&str> = ics.split("\r\n").collect();

        assert_eq!(lines[0], "BEGIN:VCALENDAR");
        assert!(lines.contains(&"UID:00000000-0000-0000-0000-000000000000@rally"));
        assert!(lines.contains(&"DTSTART:20250301T170000Z"));
        assert!(lines.contains(&"DTEND:20250301T180000Z"));
        assert!(lines.contains(&"SUMMARY:Tennis at Court 3"));
        assert!(lines.contains(&"LOCATION:Court 3"));
        assert_eq!(lines[lines.len() - 2], "END:VCALENDAR");
        assert_eq!(lines[lines.len() - 1], "");
    }

    #[test]
    fn ics_text_is_escaped_and_folded() {
        let mut event = CalendarEvent::new("Doubles; bring balls, water", Utc::now());
        event.description = Some(format!("line one\n{}", "é".repeat(60)));

        let ics = event.to_ics();
        assert!(ics.contains("SUMMARY:Doubles\\; bring balls\\, water\r\n"));
        assert!(ics.contains("DESCRIPTION:line one\\n"));
        assert!(ics.split("\r\n").all(|line| line.len() <= ICS_LINE_LIMIT));

        let unfolded = ics.replace("\r\n ", "");
        assert!(unfolded.contains(&"é".repeat(60)));
    }

    #[test]
    fn google_link_carries_the_session() {
        let url = CalendarEvent::for_proposal(&proposal(Some("Parc & Club"))).google_calendar_url();

        assert!(url.starts_with("https://calendar.google.com/calendar/render?action=TEMPLATE&"));
        assert!(url.contains("text=Tennis+at+Parc+%26+Club"));
        assert!(url.contains("location=Parc+%26+Club"));
        assert!(url.contains("dates=20250301T170000Z%2F20250301T180000Z"));
    }

    #[test]
    fn google_link_without_court_leaves_location_empty() {
        let url = CalendarEvent::for_proposal(&proposal(None)).google_calendar_url();
        assert!(url.contains("text=Tennis+session"));
        assert!(url.contains("&location=&"));
    }

    #[test]
    fn file_name_joins_words() {
        let event = CalendarEvent::new("Tennis  at\tCourt 3", Utc::now());
        assert_eq!(event.file_name(), "Tennis_at_Court_3.ics");

        let quoted = CalendarEvent::new("Tennis at \"Élan\"", Utc::now());
        assert_eq!(quoted.file_name(), "Tennis_at_lan.ics");
        assert_eq!(CalendarEvent::new("  ", Utc::now()).file_name(), "session.ics");
    }
}
