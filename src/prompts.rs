//! Versioned prompt builders for Round 2 replies and Round 3 debate
//! speeches. Prompt versions are part of the external contract: they are
//! written into every trace row.
//!
//! Context blocks are canonical JSON (sorted keys, no whitespace) so the
//! same state always produces byte-identical prompts.

use crate::state::{ActiveIssue, InitialStances, IssueStance};
use serde_json::{json, Map, Value};
use std::fs;
use std::sync::OnceLock;

pub const R2_CONVO_PROMPT_VERSION: &str = "r2_convo_v3";
pub const R3_DEBATE_SPEECH_PROMPT_VERSION: &str = "r3_debate_speech_v1";

pub const ROUND2_TRANSCRIPT_TAIL_LIMIT: usize = 10;
pub const ROUND2_ISSUE_LIMIT: usize = 4;
pub const ROUND2_OPTION_LIMIT: usize = 8;
pub const ROUND3_PUBLIC_DEBATE_TAIL_LIMIT: usize = 8;
pub const ROUND3_DEBATE_SNIPPET_LEN: usize = 240;

const ROUND2_INSTRUCTIONS_DEFAULT: &str = include_str!("../prompts/round2_behavior_instructions_v1.txt");
const ROUND3_INSTRUCTIONS_DEFAULT: &str = include_str!("../prompts/round3_debate_speech_instructions_v1.txt");

/// Template read once from disk per process, falling back to the
/// compiled-in copy when the prompts directory is not present.
fn load_template(cache: &'static OnceLock<String>, path: &str, fallback: &str) -> &'static str {
    cache.get_or_init(|| fs::read_to_string(path).unwrap_or_else(|_| fallback.to_string()))
}

fn round2_instructions(role: &str, human_role: &str) -> String {
    static CACHE: OnceLock<String> = OnceLock::new();
    load_template(
        &CACHE,
        "prompts/round2_behavior_instructions_v1.txt",
        ROUND2_INSTRUCTIONS_DEFAULT,
    )
    .replace("{ROLE}", role)
    .replace("{HUMAN_ROLE}", human_role)
    .trim()
    .to_string()
}

fn round3_instructions() -> String {
    static CACHE: OnceLock<String> = OnceLock::new();
    load_template(
        &CACHE,
        "prompts/round3_debate_speech_instructions_v1.txt",
        ROUND3_INSTRUCTIONS_DEFAULT,
    )
    .trim()
    .to_string()
}

/// One transcript row fed into a prompt context.
#[derive(Debug, Clone)]
pub struct TailEntry {
    pub role_id: String,
    pub content: String,
}

/// Compact issue listing for Round-2 context.
#[derive(Debug, Clone)]
pub struct IssueBrief {
    pub issue_id: String,
    pub title: String,
    /// (option_id, label) pairs
    pub options: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub prompt_version: &'static str,
    pub prompt: String,
    pub request_payload: Value,
}

pub struct Round2PromptInput<'a> {
    pub game_id: &'a str,
    pub status: &'a str,
    pub human_content: &'a str,
    pub partner_role: &'a str,
    pub human_role: &'a str,
    pub convo_key: &'a str,
    pub human_turns: u32,
    pub ai_turns: u32,
    pub partner_initial_stances: Option<&'a InitialStances>,
    pub human_opening_text: Option<&'a str>,
    pub transcript_tail: &'a [TailEntry],
    pub issues: &'a [IssueBrief],
}

fn canonical_json(value: &Value) -> String {
    // serde_json maps are BTreeMap-backed: keys come out sorted, and
    // to_string emits no whitespace.
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// First sentence of an opening statement, or a bounded prefix.
fn summarize_opening(opening_text: &str) -> String {
    if opening_text.is_empty() {
        return String::new();
    }
    let first = opening_text.split('.').next().unwrap_or("").trim();
    if first.is_empty() {
        truncate_chars(opening_text, ROUND3_DEBATE_SNIPPET_LEN)
    } else {
        format!("{}.", first)
    }
}

pub fn build_round2_conversation_prompt(input: &Round2PromptInput) -> BuiltPrompt {
    let initial_stances = input
        .partner_initial_stances
        .map(|s| serde_json::to_value(s).unwrap_or_else(|_| json!({})))
        .unwrap_or_else(|| json!({}));
    let openings = json!({
        "partner_role": input.partner_role,
        "partner_opening": {
            "initial_stances": initial_stances,
            "conversation_interests": {},
        },
        "human_opening_text": input.human_opening_text.unwrap_or(""),
    });

    let tail_start = input.transcript_tail.len().saturating_sub(ROUND2_TRANSCRIPT_TAIL_LIMIT);
    let transcript_tail: Vec<Value> = input.transcript_tail[tail_start..]
        .iter()
        .map(|entry| json!({"role_id": entry.role_id, "content": entry.content}))
        .collect();

    let issues: Vec<Value> = input
        .issues
        .iter()
        .take(ROUND2_ISSUE_LIMIT)
        .map(|issue| {
            let options: Vec<Value> = issue
                .options
                .iter()
                .take(ROUND2_OPTION_LIMIT)
                .map(|(option_id, label)| json!({"option_id": option_id, "label": label}))
                .collect();
            json!({"issue_id": issue.issue_id, "title": issue.title, "options": options})
        })
        .collect();

    let context = json!({
        "openings": openings,
        "transcript_tail": transcript_tail,
        "issues": issues,
    });

    let instructions = round2_instructions(input.partner_role, input.human_role);
    let prompt = format!(
        "{}\n\nContext:\n{}\n\nHuman message:\n{}",
        instructions,
        canonical_json(&context),
        input.human_content
    );

    let request_payload = json!({
        "game_id": input.game_id,
        "role_id": input.partner_role,
        "status": input.status,
        "partner_role": input.partner_role,
        "convo": input.convo_key,
        "human_turns": input.human_turns,
        "ai_turns": input.ai_turns,
        "prompt": prompt,
        "prompt_version": R2_CONVO_PROMPT_VERSION,
        "context": context,
    });

    BuiltPrompt {
        prompt_version: R2_CONVO_PROMPT_VERSION,
        prompt,
        request_payload,
    }
}

pub struct Round3SpeechInput<'a> {
    pub active_issue: &'a ActiveIssue,
    pub speaker_role: &'a str,
    pub speech_number: usize,
    pub debate_round: u8,
    pub opening_text: &'a str,
    pub stance_snapshot: Option<&'a IssueStance>,
    pub debate_tail: &'a [TailEntry],
}

fn stance_snapshot_value(stance: Option<&IssueStance>) -> Value {
    let Some(stance) = stance else {
        return json!({});
    };
    let mut map = Map::new();
    if let Some(preferred) = &stance.preferred {
        map.insert("preferred".to_string(), json!(preferred));
    }
    map.insert("firmness".to_string(), json!(stance.firmness));
    map.insert("acceptance".to_string(), json!(stance.acceptance));
    if let Some(conditions) = &stance.conditions {
        map.insert("conditions".to_string(), json!(conditions));
    }
    Value::Object(map)
}

pub fn build_round3_debate_speech_prompt(input: &Round3SpeechInput) -> BuiltPrompt {
    let issue = input.active_issue;
    let options: Vec<Value> = issue
        .options
        .iter()
        .map(|opt| {
            let short_text = if opt.short_description.is_empty() {
                &opt.label
            } else {
                &opt.short_description
            };
            json!({"id": opt.option_id, "label": opt.label, "short_text": short_text})
        })
        .collect();

    let tail_start = input.debate_tail.len().saturating_sub(ROUND3_PUBLIC_DEBATE_TAIL_LIMIT);
    let tail: Vec<Value> = input.debate_tail[tail_start..]
        .iter()
        .map(|entry| {
            json!({
                "role_id": entry.role_id,
                "role_name": entry.role_id,
                "text_snippet": truncate_chars(&entry.content, ROUND3_DEBATE_SNIPPET_LEN),
            })
        })
        .collect();

    let opening_summary = summarize_opening(input.opening_text);
    let stance_snapshot = stance_snapshot_value(input.stance_snapshot);

    let context = json!({
        "active_issue": {"id": issue.issue_id, "title": issue.issue_title, "options": options},
        "speech_slot": {"speech_number": input.speech_number, "debate_round": input.debate_round},
        "speaker": {"role_id": input.speaker_role, "role_name": input.speaker_role, "is_human": false},
        "speaker_opening_summary": opening_summary,
        "speaker_issue_stance_snapshot": stance_snapshot,
        "debate_transcript_tail": tail,
    });

    let instructions = round3_instructions();
    let prompt = format!("{}\n\nContext:\n{}\n\nSpeech:\n", instructions, canonical_json(&context));

    let request_payload = json!({
        "prompt_version": R3_DEBATE_SPEECH_PROMPT_VERSION,
        "speech_number": input.speech_number,
        "round_number": 3,
        "issue_id": issue.issue_id,
        "issue_title": issue.issue_title,
        "options": context["active_issue"]["options"],
        "speaker_role": input.speaker_role,
        "speaker_role_name": input.speaker_role,
        "speaker_opening_summary": context["speaker_opening_summary"],
        "speaker_issue_stance_snapshot": context["speaker_issue_stance_snapshot"],
        "debate_transcript_tail": context["debate_transcript_tail"],
        "debate_round": input.debate_round,
        "context": context,
    });

    BuiltPrompt {
        prompt_version: R3_DEBATE_SPEECH_PROMPT_VERSION,
        prompt,
        request_payload,
    }
}
