//! Rule-based mapping of transcript sentences to task proposals.
//!
//! Runs without the oracle: sentences that carry an action phrase become
//! [`MappedTask`]s with an owner, deadline and blocker inferred from text.

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use nova_agent_core::{AutoMappedTaskPayload, Proposal, SuggestionPayload, User, UserId};

const MIN_SENTENCE_CHARS: usize = 10;
const TITLE_MAX_CHARS: usize = 80;
const BLOCKER_MAX_CHARS: usize = 100;
const DESCRIPTION_MAX_CHARS: usize = 200;

pub const ACTION_PHRASES: [&str; 6] = ["will", "should", "need to", "must", "going to", "has to"];
const TITLE_LEADERS: [&str; 7] = [
    "i will", "we will", "should", "need to", "must", "going to", "has to",
];
const BLOCKER_KEYWORDS: [&str; 5] = [
    "blocked by",
    "waiting for",
    "pending",
    "stuck on",
    "need approval",
];
const URGENT_WORDS: [&str; 5] = ["urgent", "critical", "asap", "immediately", "emergency"];
const ELEVATED_WORDS: [&str; 4] = ["important", "soon", "priority", "should"];
const COMMITMENT_WORDS: [&str; 3] = ["will", "must", "need to"];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MappedTask {
    pub title: String,
    pub description: String,
    pub owner_id: Option<UserId>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deadline: Option<OffsetDateTime>,
    pub blockers: Option<String>,
    pub priority: u8,
    pub confidence: f32,
}

impl MappedTask {
    #[must_use]
    pub fn into_proposal(self) -> Proposal {
        Proposal {
            payload: SuggestionPayload::AutoMappedTask(AutoMappedTaskPayload {
                title: self.title,
                description: self.description,
                owner_id: self.owner_id,
                deadline: self.deadline,
                blockers: self.blockers,
                priority: self.priority,
            }),
            confidence: self.confidence,
        }
    }
}

/// Maps every actionable sentence of `transcript`, in order.
#[must_use]
pub fn auto_map_transcript(
    transcript: &str,
    users: &[User],
    now: OffsetDateTime,
) -> Vec<MappedTask> {
    transcript
        .split('.')
        .map(str::trim)
        .filter(|sentence| sentence.chars().count() >= MIN_SENTENCE_CHARS)
        .filter_map(|sentence| map_sentence(sentence, users, now))
        .collect()
}

fn map_sentence(sentence: &str, users: &[User], now: OffsetDateTime) -> Option<MappedTask> {
    let lowered = sentence.to_lowercase();
    if !ACTION_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
        return None;
    }

    let title = extract_title(sentence);
    if title.is_empty() {
        return None;
    }

    let owner = extract_owner(sentence, users);
    let deadline = extract_deadline(sentence, now);
    let confidence = mapping_confidence(&lowered, owner.is_some(), deadline.is_some());

    Some(MappedTask {
        title,
        description: truncate_chars(sentence, DESCRIPTION_MAX_CHARS),
        owner_id: owner.map(|user| user.user_id),
        deadline,
        blockers: extract_blockers(sentence),
        priority: priority_from_language(&lowered),
        confidence,
    })
}

/// Drops a leading commitment phrase and caps the length.
#[must_use]
pub fn extract_title(sentence: &str) -> String {
    let trimmed = sentence.trim();
    let lowered = trimmed.to_lowercase();
    let mut body = trimmed;
    for leader in TITLE_LEADERS {
        if lowered.starts_with(leader) && lowered.is_char_boundary(leader.len()) {
            let rest = &lowered[leader.len()..];
            if rest.starts_with(char::is_whitespace) && trimmed.is_char_boundary(leader.len()) {
                body = trimmed[leader.len()..].trim_start();
                break;
            }
        }
    }
    truncate_chars(body, TITLE_MAX_CHARS).trim().to_string()
}

/// A user named in the sentence, else the first `dev` when developers are
/// mentioned generically.
#[must_use]
pub fn extract_owner<'a>(sentence: &str, users: &'a [User]) -> Option<&'a User> {
    let lowered = sentence.to_lowercase();
    let named = users.iter().find(|user| {
        [&user.display_name, &user.username]
            .into_iter()
            .map(|name| name.trim().to_lowercase())
            .any(|name| !name.is_empty() && lowered.contains(&name))
    });
    if named.is_some() {
        return named;
    }
    if lowered.contains("dev") {
        return users.iter().find(|user| user.role == "dev");
    }
    None
}

#[must_use]
pub fn extract_deadline(sentence: &str, now: OffsetDateTime) -> Option<OffsetDateTime> {
    let lowered = sentence.to_lowercase();
    if lowered.contains("today") {
        return Some(now);
    }
    if lowered.contains("tomorrow") {
        return Some(now + Duration::days(1));
    }
    if lowered.contains("next week") {
        return Some(now + Duration::days(7));
    }
    if lowered.contains("end of week") || lowered.contains("friday") {
        let weekday = i64::from(now.weekday().number_days_from_monday());
        return Some(now + Duration::days((4 - weekday).rem_euclid(7)));
    }
    if lowered.contains("next month") {
        return Some(now + Duration::days(30));
    }
    if has_by_phrase(&lowered) {
        return Some(now + Duration::days(7));
    }
    in_n_days(&lowered).map(|days| now + Duration::days(days))
}

fn has_by_phrase(lowered: &str) -> bool {
    lowered.match_indices("by ").any(|(idx, matched)| {
        lowered[idx + matched.len()..]
            .chars()
            .next()
            .is_some_and(|next| next.is_alphanumeric() || next == '_')
    })
}

fn in_n_days(lowered: &str) -> Option<i64> {
    lowered.match_indices("in ").find_map(|(idx, matched)| {
        let rest = &lowered[idx + matched.len()..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return None;
        }
        let after = rest[digits.len()..].trim_start_matches(' ');
        if !after.starts_with("day") || rest[digits.len()..].len() == after.len() {
            return None;
        }
        digits.parse::<i64>().ok()
    })
}

/// Text from the first blocker keyword onwards, capped.
#[must_use]
pub fn extract_blockers(sentence: &str) -> Option<String> {
    sentence.char_indices().find_map(|(idx, _)| {
        let tail = &sentence[idx..];
        let lowered = tail.to_lowercase();
        BLOCKER_KEYWORDS
            .iter()
            .any(|keyword| lowered.starts_with(keyword))
            .then(|| truncate_chars(tail, BLOCKER_MAX_CHARS))
    })
}

#[must_use]
pub fn priority_from_language(lowered: &str) -> u8 {
    if URGENT_WORDS.iter().any(|word| lowered.contains(word)) {
        9
    } else if ELEVATED_WORDS.iter().any(|word| lowered.contains(word)) {
        7
    } else {
        5
    }
}

fn mapping_confidence(lowered: &str, has_owner: bool, has_deadline: bool) -> f32 {
    let mut confidence: f32 = 0.5;
    if COMMITMENT_WORDS.iter().any(|word| lowered.contains(word)) {
        confidence += 0.2;
    }
    if has_owner || lowered.contains("i will") {
        confidence += 0.15;
    }
    if has_deadline {
        confidence += 0.15;
    }
    confidence.min(0.95)
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn users() -> Vec<User> {
        vec![
            User {
                user_id: UserId::new(),
                username: "sarah".to_string(),
                display_name: "Sarah Chen".to_string(),
                role: "qa".to_string(),
            },
            User {
                user_id: UserId::new(),
                username: "john".to_string(),
                display_name: "John Park".to_string(),
                role: "dev".to_string(),
            },
        ]
    }

    // 2025-01-15 is a Wednesday.
    const NOW: OffsetDateTime = datetime!(2025-01-15 09:00 UTC);

    #[test]
    fn actionable_sentences_map_with_owner_and_deadline() {
        let team = users();
        let transcript = "Sarah will finish the regression suite by Friday. Nice weather today. \
                          John has to fix the login crash asap.";
        let mapped = auto_map_transcript(transcript, &team, NOW);
        assert_eq!(mapped.len(), 2);

        assert_eq!(mapped[0].owner_id, Some(team[0].user_id));
        assert_eq!(mapped[0].deadline, Some(datetime!(2025-01-17 09:00 UTC)));
        assert_eq!(mapped[0].priority, 5);
        assert!((mapped[0].confidence - 0.95).abs() < 1e-6);

        assert_eq!(mapped[1].owner_id, Some(team[1].user_id));
        assert_eq!(mapped[1].priority, 9);
        assert_eq!(mapped[1].deadline, None);
    }

    #[test]
    fn short_and_non_actionable_sentences_are_skipped() {
        let mapped = auto_map_transcript("We will. Lunch was great overall.", &users(), NOW);
        assert!(mapped.is_empty());
    }

    #[test]
    fn title_strips_leading_commitment_phrase() {
        assert_eq!(extract_title("I will update the docs"), "update the docs");
        assert_eq!(extract_title("Need to rotate keys"), "rotate keys");
        assert_eq!(extract_title("Musterdata will sync"), "Musterdata will sync");
        let long = format!("We will {}", "x".repeat(120));
        assert_eq!(extract_title(&long).chars().count(), 80);
    }

    #[test]
    fn generic_dev_mention_falls_back_to_first_developer() {
        let team = users();
        let owner = extract_owner("A dev should look at the flaky test", &team);
        assert_eq!(owner.map(|user| user.user_id), Some(team[1].user_id));
        assert!(extract_owner("Someone should look at it", &team).is_none());
    }

    #[test]
    fn deadline_phrases_resolve_relative_to_now() {
        assert_eq!(extract_deadline("ship it today", NOW), Some(NOW));
        assert_eq!(
            extract_deadline("done tomorrow", NOW),
            Some(NOW + Duration::days(1))
        );
        assert_eq!(
            extract_deadline("wrap up next month", NOW),
            Some(NOW + Duration::days(30))
        );
        assert_eq!(
            extract_deadline("finish by Monday", NOW),
            Some(NOW + Duration::days(7))
        );
        assert_eq!(
            extract_deadline("land it in 3 days", NOW),
            Some(NOW + Duration::days(3))
        );
        assert_eq!(extract_deadline("no date here", NOW), None);

        let friday = datetime!(2025-01-17 09:00 UTC);
        assert_eq!(extract_deadline("by end of week", friday), Some(friday));
        let saturday = datetime!(2025-01-18 09:00 UTC);
        assert_eq!(
            extract_deadline("before friday", saturday),
            Some(saturday + Duration::days(6))
        );
    }

    #[test]
    fn blockers_capture_text_from_keyword() {
        assert_eq!(
            extract_blockers("We will deploy, Blocked by infra ticket"),
            Some("Blocked by infra ticket".to_string())
        );
        assert_eq!(extract_blockers("We will deploy tonight"), None);
    }

    #[test]
    fn mapped_task_becomes_auto_mapped_proposal() {
        let mapped = auto_map_transcript("I will write the release notes today.", &[], NOW);
        assert_eq!(mapped.len(), 1);
        let proposal = mapped[0].clone().into_proposal();
        assert_eq!(
            proposal.payload.kind(),
            nova_agent_core::SuggestionKind::AutoMappedTask
        );
        assert!(proposal.payload.validate().is_ok());
    }
}
