//! Prompt assembly.
//!
//! The generator prompt interleaves persona, wall-clock, memory, and the
//! user text freely. The refiner prompt is different: its opening span must
//! be byte-identical across calls for a user (persona block + fixed
//! directive + the slow-moving summary), with everything per-message
//! strictly after it. [`stable_refiner_prompt`] owns that layout.

use chrono::{DateTime, Duration, Utc};
use maren_config::PersonaSection;
use maren_core::{Commitment, clock};
use maren_llm::StablePrompt;
use maren_memory::MemoryEntry;

/// Pick the persona block for a rotation index. Index 0 is the base
/// prompt; identity-conflict rotation walks the variants.
#[must_use]
pub fn persona_block(persona: &PersonaSection, variant_index: u64) -> &str {
    if variant_index == 0 || persona.prompt_variants.is_empty() {
        &persona.system_prompt
    } else {
        #[allow(clippy::cast_possible_truncation)]
        let idx = ((variant_index - 1) as usize) % persona.prompt_variants.len();
        &persona.prompt_variants[idx]
    }
}

/// Build the generator call: `(system, user)`.
#[must_use]
pub fn generator_prompt(
    persona: &PersonaSection,
    variant_index: u64,
    now: DateTime<Utc>,
    summary: &str,
    history: &[MemoryEntry],
    user_text: &str,
    recovered_age: Option<Duration>,
) -> (String, String) {
    let mut system = persona_block(persona, variant_index).to_owned();
    system.push_str("\n\nCurrent time: ");
    system.push_str(&clock::persona_local(now, persona.utc_offset_minutes));

    let mut user = String::new();
    if !summary.is_empty() {
        user.push_str("Context from earlier:\n");
        user.push_str(summary);
        user.push_str("\n\n");
    }
    if !history.is_empty() {
        user.push_str("Recent messages:\n");
        for entry in history {
            user.push_str(&format!("{}: {}\n", entry.role, entry.text));
        }
        user.push('\n');
    }
    if let Some(age) = recovered_age {
        user.push_str(&format!(
            "(The user sent this {} ago; you are only seeing it now.)\n",
            clock::humanize_age(age)
        ));
    }
    user.push_str("User says:\n");
    user.push_str(user_text);
    (system, user)
}

/// Build the bubble-formatting call with the cache-stable layout.
#[must_use]
pub fn stable_refiner_prompt(
    persona: &PersonaSection,
    summary: &str,
    draft: &str,
    latest_user_text: &str,
) -> StablePrompt {
    // Stable span: persona + fixed directive + slow-moving summary. The
    // summary only changes when memory compression rewrites it.
    let mut stable = persona.system_prompt.clone();
    stable.push_str("\n\n");
    stable.push_str(&persona.refiner_directive);
    if !summary.is_empty() {
        stable.push_str("\n\nWhat you know about this user:\n");
        stable.push_str(summary);
    }

    let dynamic = format!("Latest user message:\n{latest_user_text}\n\nDraft to rewrite:\n{draft}");
    StablePrompt { stable, dynamic }
}

/// System directive for the coherence analysis call.
#[must_use]
pub fn coherence_directive() -> String {
    "You audit a draft reply against the persona's standing commitments. \
     Respond with ONLY a JSON object, no prose, shaped as: \
     {\"status\": \"ok\" | \"availability_conflict\" | \"identity_conflict\", \
     \"original_span\": string?, \"replacement_span\": string?, \
     \"new_commitments\": [{\"text\": string, \"target_ts\": string}]?}. \
     Use availability_conflict when the draft schedules something clashing \
     with a commitment and propose a minimal replacement span. Use \
     identity_conflict when the draft contradicts who the persona is. \
     Extract any new promises the draft makes as new_commitments with \
     RFC 3339 target timestamps."
        .to_owned()
}

/// Payload for the coherence analysis call.
#[must_use]
pub fn coherence_payload(
    draft: &str,
    commitments: &[Commitment],
    now: DateTime<Utc>,
    utc_offset_minutes: i32,
) -> String {
    let mut payload = format!(
        "Current time: {}\n\nActive commitments:\n",
        clock::persona_local(now, utc_offset_minutes)
    );
    if commitments.is_empty() {
        payload.push_str("(none)\n");
    } else {
        for commitment in commitments {
            payload.push_str(&format!(
                "- {} (due {})\n",
                commitment.text,
                commitment.target_ts.to_rfc3339()
            ));
        }
    }
    payload.push_str("\nDraft reply:\n");
    payload.push_str(draft);
    payload
}

/// Directive for the one JSON repair pass through the small model.
#[must_use]
pub fn repair_directive() -> String {
    "The following text was supposed to be a single JSON object but is \
     malformed. Return ONLY the corrected JSON object, nothing else."
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn persona() -> PersonaSection {
        PersonaSection {
            name: "Maren".to_owned(),
            system_prompt: "You are Maren, a med student from Bergen.".to_owned(),
            prompt_variants: vec!["Variant A".to_owned(), "Variant B".to_owned()],
            utc_offset_minutes: 60,
            refiner_directive: "Rewrite as bubbles separated by [BUBBLE].".to_owned(),
        }
    }

    #[test]
    fn test_variant_rotation() {
        let p = persona();
        assert_eq!(persona_block(&p, 0), p.system_prompt);
        assert_eq!(persona_block(&p, 1), "Variant A");
        assert_eq!(persona_block(&p, 2), "Variant B");
        assert_eq!(persona_block(&p, 3), "Variant A");
    }

    #[test]
    fn test_generator_prompt_includes_preamble_for_recovered() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let (_, user) = generator_prompt(
            &persona(),
            0,
            now,
            "",
            &[],
            "hello?",
            Some(Duration::hours(3)),
        );
        assert!(user.contains("about 3 hours ago"));
        assert!(user.ends_with("hello?"));
    }

    #[test]
    fn test_stable_prefix_is_byte_identical_across_messages() {
        let p = persona();
        let a = stable_refiner_prompt(&p, "summary text", "draft one", "msg one");
        let b = stable_refiner_prompt(&p, "summary text", "draft two", "msg two");
        assert_eq!(a.stable, b.stable);
        assert_ne!(a.dynamic, b.dynamic);
        // Dynamic parts appear strictly after the stable span.
        assert!(a.dynamic.contains("draft one"));
        assert!(!a.stable.contains("draft one"));
    }

    #[test]
    fn test_stable_prefix_changes_only_with_summary() {
        let p = persona();
        let a = stable_refiner_prompt(&p, "old summary", "d", "m");
        let b = stable_refiner_prompt(&p, "new summary", "d", "m");
        assert_ne!(a.stable, b.stable);
    }
}
