//! Roster constants and the typed per-game state blob.
//!
//! The blob is owned by exactly one game row and persisted as JSON through
//! serde; domain code only ever touches the typed structs.

use crate::rng::{deterministic_shuffle, stable_int};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const COUNTRIES: [&str; 6] = ["BRA", "CAN", "CHN", "EU", "TZA", "USA"];
pub const NGOS: [&str; 3] = ["AMAP", "MFF", "WCPA"];
pub const CHAIR: &str = "JPN";
pub const ISSUES: [&str; 4] = ["1", "2", "3", "4"];

/// Roll-call order for country votes. Fixed, and also the canonical key
/// order for every persisted votes mapping.
pub fn vote_order() -> Vec<String> {
    COUNTRIES.iter().map(|s| s.to_string()).collect()
}

pub const DEFAULT_FIRMNESS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameStatus {
    #[serde(rename = "ROLE_SELECTION")]
    RoleSelection,
    #[serde(rename = "ROUND_1_SETUP")]
    Round1Setup,
    #[serde(rename = "ROUND_1_OPENING_STATEMENTS")]
    Round1OpeningStatements,
    #[serde(rename = "ROUND_2_SETUP")]
    Round2Setup,
    #[serde(rename = "ROUND_2_SELECT_CONVO_1")]
    Round2SelectConvo1,
    #[serde(rename = "ROUND_2_CONVERSATION_ACTIVE")]
    Round2ConversationActive,
    #[serde(rename = "ROUND_2_SELECT_CONVO_2")]
    Round2SelectConvo2,
    #[serde(rename = "ROUND_2_WRAP_UP")]
    Round2WrapUp,
    #[serde(rename = "ROUND_3_SETUP")]
    Round3Setup,
    #[serde(rename = "ISSUE_INTRO")]
    IssueIntro,
    #[serde(rename = "ISSUE_DEBATE_ROUND_1")]
    IssueDebateRound1,
    #[serde(rename = "ISSUE_DEBATE_ROUND_2")]
    IssueDebateRound2,
    #[serde(rename = "ISSUE_POSITION_FINALIZATION")]
    IssuePositionFinalization,
    #[serde(rename = "ISSUE_PROPOSAL_SELECTION")]
    IssueProposalSelection,
    #[serde(rename = "ISSUE_VOTE")]
    IssueVote,
    #[serde(rename = "ISSUE_RESOLUTION")]
    IssueResolution,
    #[serde(rename = "REVIEW")]
    Review,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::RoleSelection => "ROLE_SELECTION",
            GameStatus::Round1Setup => "ROUND_1_SETUP",
            GameStatus::Round1OpeningStatements => "ROUND_1_OPENING_STATEMENTS",
            GameStatus::Round2Setup => "ROUND_2_SETUP",
            GameStatus::Round2SelectConvo1 => "ROUND_2_SELECT_CONVO_1",
            GameStatus::Round2ConversationActive => "ROUND_2_CONVERSATION_ACTIVE",
            GameStatus::Round2SelectConvo2 => "ROUND_2_SELECT_CONVO_2",
            GameStatus::Round2WrapUp => "ROUND_2_WRAP_UP",
            GameStatus::Round3Setup => "ROUND_3_SETUP",
            GameStatus::IssueIntro => "ISSUE_INTRO",
            GameStatus::IssueDebateRound1 => "ISSUE_DEBATE_ROUND_1",
            GameStatus::IssueDebateRound2 => "ISSUE_DEBATE_ROUND_2",
            GameStatus::IssuePositionFinalization => "ISSUE_POSITION_FINALIZATION",
            GameStatus::IssueProposalSelection => "ISSUE_PROPOSAL_SELECTION",
            GameStatus::IssueVote => "ISSUE_VOTE",
            GameStatus::IssueResolution => "ISSUE_RESOLUTION",
            GameStatus::Review => "REVIEW",
        }
    }

    pub fn parse(value: &str) -> Option<GameStatus> {
        serde_json::from_value(serde_json::Value::String(value.to_string())).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleInfo {
    #[serde(rename = "type")]
    pub role_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvoStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "CLOSED")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvoPhase {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "POST_INTERRUPT")]
    PostInterrupt,
    #[serde(rename = "CLOSED")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HumanPlacement {
    #[serde(rename = "first")]
    First,
    #[serde(rename = "random")]
    Random,
    #[serde(rename = "skip")]
    Skip,
}

impl HumanPlacement {
    pub fn parse(value: &str) -> Option<HumanPlacement> {
        match value {
            "first" => Some(HumanPlacement::First),
            "random" => Some(HumanPlacement::Random),
            "skip" => Some(HumanPlacement::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteChoice {
    #[serde(rename = "YES")]
    Yes,
    #[serde(rename = "NO")]
    No,
}

impl VoteChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteChoice::Yes => "YES",
            VoteChoice::No => "NO",
        }
    }

    pub fn parse(value: &str) -> Option<VoteChoice> {
        match value {
            "YES" => Some(VoteChoice::Yes),
            "NO" => Some(VoteChoice::No),
            _ => None,
        }
    }
}

/// Per-issue stance held by one role: acceptance per option (null means
/// "not applicable" and is immutable), plus scalar firmness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueStance {
    #[serde(default)]
    pub acceptance: BTreeMap<String, Option<f64>>,
    pub firmness: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<String>>,
}

impl IssueStance {
    pub fn with_firmness(firmness: f64) -> Self {
        Self {
            acceptance: BTreeMap::new(),
            firmness,
            preferred: None,
            conditions: None,
        }
    }
}

pub type RoleStances = BTreeMap<String, IssueStance>;

/// One recorded stance change, appended to the round's stance log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StanceChange {
    pub role_id: String,
    pub round_id: u8,
    pub issue_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_acceptance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_firmness: Option<f64>,
    pub rule: String,
    pub trigger: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialIssueStance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<BTreeMap<String, Option<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmness: Option<f64>,
}

/// Stance priors attached to an opening variant, keyed `ISSUE_<n>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialStances {
    #[serde(default)]
    pub by_issue_id: BTreeMap<String, InitialIssueStance>,
}

/// One seeded opening-statement variant for a role.
#[derive(Debug, Clone)]
pub struct OpeningVariant {
    pub id: String,
    pub role_id: String,
    pub opening_text: String,
    pub initial_stances: Option<InitialStances>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpeningChoice {
    pub variant_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_stances: Option<InitialStances>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Round1State {
    #[serde(default)]
    pub speaker_order: Vec<String>,
    #[serde(default)]
    pub openings: BTreeMap<String, OpeningChoice>,
    #[serde(default)]
    pub cursor: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvoState {
    pub partner_role: String,
    pub status: ConvoStatus,
    pub phase: ConvoPhase,
    pub human_turns_used: u32,
    pub ai_turns_used: u32,
    #[serde(default)]
    pub post_interrupt: bool,
    #[serde(default)]
    pub final_human_sent: bool,
    #[serde(default)]
    pub final_ai_sent: bool,
}

impl ConvoState {
    pub fn open(partner_role: &str) -> Self {
        Self {
            partner_role: partner_role.to_string(),
            status: ConvoStatus::Active,
            phase: ConvoPhase::Open,
            human_turns_used: 0,
            ai_turns_used: 0,
            post_interrupt: false,
            final_human_sent: false,
            final_ai_sent: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Round2State {
    #[serde(default)]
    pub active_convo_index: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convo1: Option<ConvoState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convo2: Option<ConvoState>,
    #[serde(default)]
    pub stance_log: Vec<StanceChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueOption {
    pub option_id: String,
    pub label: String,
    pub short_description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub passed: bool,
    pub final_votes: BTreeMap<String, VoteChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveIssue {
    pub issue_id: String,
    pub issue_title: String,
    pub ui_prompt: String,
    pub options: Vec<IssueOption>,
    pub human_placement_choice: HumanPlacement,
    pub debate_queue: Vec<String>,
    pub debate_cursor: usize,
    pub debate_round: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_option_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_support_snapshot: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub vote_order: Vec<String>,
    #[serde(default)]
    pub next_voter_index: usize,
    #[serde(default)]
    pub votes: BTreeMap<String, VoteChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub resolution_written: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Round3State {
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub active_issue_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_issue: Option<ActiveIssue>,
    #[serde(default)]
    pub closed_issues: Vec<String>,
    #[serde(default)]
    pub stance_log: Vec<StanceChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub checkpoint_id: String,
    pub created_at: String,
    pub status: String,
    pub transcript_upto: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameState {
    pub version: String,
    pub status: GameStatus,
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub human_role_id: Option<String>,
    pub roles: BTreeMap<String, RoleInfo>,
    #[serde(default)]
    pub round1: Round1State,
    #[serde(default)]
    pub round2: Round2State,
    #[serde(default)]
    pub round3: Round3State,
    #[serde(default)]
    pub stances: BTreeMap<String, RoleStances>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointRef>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Fresh state for a newly created game.
pub fn initial_state() -> GameState {
    let mut roles = BTreeMap::new();
    for role in COUNTRIES {
        roles.insert(role.to_string(), RoleInfo { role_type: "country".to_string() });
    }
    for role in NGOS {
        roles.insert(role.to_string(), RoleInfo { role_type: "ngo".to_string() });
    }
    roles.insert(CHAIR.to_string(), RoleInfo { role_type: "chair".to_string() });

    GameState {
        version: "v1".to_string(),
        status: GameStatus::RoleSelection,
        game_id: None,
        human_role_id: None,
        roles,
        round1: Round1State::default(),
        round2: Round2State::default(),
        round3: Round3State {
            issues: ISSUES.iter().map(|s| s.to_string()).collect(),
            ..Round3State::default()
        },
        stances: BTreeMap::new(),
        checkpoints: Vec::new(),
        created_at: None,
        updated_at: None,
    }
}

/// Make sure every role has a stance entry for every issue.
pub fn ensure_default_stances(state: &mut GameState) {
    let roles: Vec<String> = state.roles.keys().cloned().collect();
    for role_id in roles {
        let role_stances = state.stances.entry(role_id).or_default();
        for issue_id in ISSUES {
            role_stances
                .entry(issue_id.to_string())
                .or_insert_with(|| IssueStance::with_firmness(DEFAULT_FIRMNESS));
        }
    }
}

fn nudge_human_off_front(mut group: Vec<String>, human_role_id: &str) -> Vec<String> {
    if group.len() > 1 && group[0] == human_role_id {
        group.swap(0, 1);
    }
    group
}

/// Round-1 speaker order: shuffled countries then shuffled NGOs, with the
/// human never first within its own subgroup. The chair never speaks.
pub fn speaker_order_with_constraint(seed: i64, human_role_id: &str) -> Vec<String> {
    let countries: Vec<String> = COUNTRIES.iter().map(|s| s.to_string()).collect();
    let ngos: Vec<String> = NGOS.iter().map(|s| s.to_string()).collect();

    let mut countries = deterministic_shuffle(&countries, seed, "round1-countries");
    let mut ngos = deterministic_shuffle(&ngos, seed, "round1-ngos");
    countries = nudge_human_off_front(countries, human_role_id);
    ngos = nudge_human_off_front(ngos, human_role_id);

    countries.into_iter().chain(ngos).collect()
}

/// Position the human within a debate subgroup queue. The chair is always
/// removed; `skip` removes the human; `random` inserts at a salted index.
pub fn human_placement(
    queue: Vec<String>,
    human_role_id: Option<&str>,
    choice: HumanPlacement,
    seed: i64,
    salt: &str,
) -> Vec<String> {
    let Some(human) = human_role_id else {
        return queue;
    };
    if !queue.iter().any(|r| r == human) {
        return queue;
    }
    if human == CHAIR || choice == HumanPlacement::Skip {
        return queue.into_iter().filter(|r| r != human).collect();
    }
    let others: Vec<String> = queue.into_iter().filter(|r| r != human).collect();
    match choice {
        HumanPlacement::First => {
            let mut out = vec![human.to_string()];
            out.extend(others);
            out
        }
        HumanPlacement::Random => {
            let idx = (stable_int(seed, salt) % (others.len() as u64 + 1)) as usize;
            let mut out = others;
            out.insert(idx, human.to_string());
            out
        }
        HumanPlacement::Skip => unreachable!(),
    }
}

/// Pick one opening variant for a role, uniformly over the candidates
/// sorted by (id, opening_text).
pub fn pick_opening_variant<'a>(
    role_id: &str,
    seed: i64,
    candidates: &'a [OpeningVariant],
) -> Option<&'a OpeningVariant> {
    if candidates.is_empty() {
        return None;
    }
    let mut ordered: Vec<&OpeningVariant> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        (a.id.as_str(), a.opening_text.as_str()).cmp(&(b.id.as_str(), b.opening_text.as_str()))
    });
    let salted = stable_int(seed, &format!("opening-{}", role_id));
    Some(ordered[(salted % ordered.len() as u64) as usize])
}

fn normalize_issue_key(issue_key: &str) -> &str {
    issue_key.strip_prefix("ISSUE_").unwrap_or(issue_key)
}

/// Merge a variant's stance priors into the role's stances. Existing
/// acceptance values — numeric or null — are never overwritten; a
/// `preferred` option backfills acceptance 0.7 when the key is absent.
pub fn apply_initial_stances(state: &mut GameState, role_id: &str, initial: &InitialStances) {
    let role_stances = state.stances.entry(role_id.to_string()).or_default();
    for (issue_key, prior) in &initial.by_issue_id {
        let issue_id = normalize_issue_key(issue_key);
        let stance = role_stances
            .entry(issue_id.to_string())
            .or_insert_with(|| IssueStance::with_firmness(DEFAULT_FIRMNESS));

        if let Some(acceptance) = &prior.acceptance {
            for (option_id, value) in acceptance {
                stance.acceptance.entry(option_id.clone()).or_insert(*value);
            }
        }
        if let Some(preferred) = &prior.preferred {
            stance.preferred.get_or_insert_with(|| preferred.clone());
            stance.acceptance.entry(preferred.clone()).or_insert(Some(0.7));
        }
        if let Some(firmness) = prior.firmness {
            stance.firmness = firmness;
        }
    }
}

/// Re-materialize a votes mapping in canonical roll-call order.
pub fn votes_in_order(votes: &BTreeMap<String, VoteChoice>) -> Vec<(String, VoteChoice)> {
    vote_order()
        .into_iter()
        .filter_map(|role| votes.get(&role).map(|v| (role, *v)))
        .collect()
}
