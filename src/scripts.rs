//! Chair script templates and default seed data.
//!
//! Scripts live in the `japan_scripts` table and render by literal
//! `{placeholder}` substitution; a missing template renders empty so a
//! sparsely seeded database still plays through.

use crate::db::{self, Database};
use crate::state::{COUNTRIES, NGOS};
use rusqlite::{params, Connection};
use serde_json::json;

pub const R1_OPEN: &str = "R1_OPEN";
pub const R1_CALL_SPEAKER: &str = "R1_CALL_SPEAKER";
pub const ISSUE_INTRO: &str = "ISSUE_INTRO";
pub const PROPOSAL: &str = "PROPOSAL";
pub const VOTE_RESULT_PASS: &str = "VOTE_RESULT_PASS";
pub const VOTE_RESULT_FAIL: &str = "VOTE_RESULT_FAIL";

/// Render a chair template by replacing `{key}` markers. `None` renders "".
pub fn render_script(template: Option<&str>, vars: &[(&str, &str)]) -> String {
    let Some(template) = template else {
        return String::new();
    };
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

/// Fetch and render in one step.
pub fn render_japan_script(
    conn: &Connection,
    script_key: &str,
    vars: &[(&str, &str)],
) -> Result<String, rusqlite::Error> {
    let template = db::fetch_japan_script(conn, script_key)?;
    Ok(render_script(template.as_deref(), vars))
}

fn table_is_empty(conn: &Connection, table: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 =
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    Ok(count == 0)
}

fn seed_japan_scripts(conn: &Connection) -> Result<(), rusqlite::Error> {
    let scripts = [
        (R1_OPEN, "The Chair calls this session to order. We begin with opening statements."),
        (R1_CALL_SPEAKER, "I recognize {speaker} for an opening statement."),
        (
            ISSUE_INTRO,
            "We now take up issue {issue_id}: {issue_title}. Options on the table: {options_list}.",
        ),
        (PROPOSAL, "The Chair proposes option {option_id} for decision."),
        (VOTE_RESULT_PASS, "The proposal passes. The decision is adopted unanimously."),
        (VOTE_RESULT_FAIL, "The proposal fails. Unanimity was not reached."),
    ];
    for (key, template) in scripts {
        conn.execute(
            "INSERT INTO japan_scripts (script_key, template) VALUES (?1, ?2)",
            params![key, template],
        )?;
    }
    Ok(())
}

fn seed_issue_definitions(conn: &Connection) -> Result<(), rusqlite::Error> {
    let issues = [
        (
            "1",
            "Emission limits",
            "How strict should binding emission limits be?",
            json!([
                {"option_id": "1.1", "label": "Strict caps", "short_description": "Binding national caps from entry into force"},
                {"option_id": "1.2", "label": "Flexible targets", "short_description": "Nationally determined targets with review"},
                {"option_id": "1.3", "label": "Voluntary pledges", "short_description": "Non-binding pledges with reporting"},
            ]),
        ),
        (
            "2",
            "Monitoring and reporting",
            "Who verifies compliance, and how often?",
            json!([
                {"option_id": "2.1", "label": "Independent inspections", "short_description": "Treaty body inspections on a fixed cycle"},
                {"option_id": "2.2", "label": "Self-reporting", "short_description": "Annual national reports, peer-reviewed"},
            ]),
        ),
        (
            "3",
            "Implementation financing",
            "How are implementation costs covered for developing parties?",
            json!([
                {"option_id": "3.1", "label": "Dedicated fund", "short_description": "New multilateral fund with assessed contributions"},
                {"option_id": "3.2", "label": "Existing channels", "short_description": "Route support through existing institutions"},
                {"option_id": "3.3", "label": "Private investment", "short_description": "Blended finance and market incentives"},
            ]),
        ),
        (
            "4",
            "Phase-out timeline",
            "By when must covered processes be phased out?",
            json!([
                {"option_id": "4.1", "label": "2035 deadline", "short_description": "Full phase-out by 2035"},
                {"option_id": "4.2", "label": "2045 deadline", "short_description": "Full phase-out by 2045 with interim milestones"},
            ]),
        ),
    ];
    for (id, title, description, options) in issues {
        conn.execute(
            "INSERT INTO issue_definitions (id, title, description, options) VALUES (?1, ?2, ?3, ?4)",
            params![id, title, description, options.to_string()],
        )?;
    }
    Ok(())
}

fn seed_opening_variants(conn: &Connection) -> Result<(), rusqlite::Error> {
    // Two variants per playable role; the first carries stance priors.
    let preferred: [(&str, [&str; 4]); 9] = [
        ("BRA", ["1.2", "2.2", "3.1", "4.2"]),
        ("CAN", ["1.2", "2.1", "3.2", "4.1"]),
        ("CHN", ["1.3", "2.2", "3.1", "4.2"]),
        ("EU", ["1.1", "2.1", "3.2", "4.1"]),
        ("TZA", ["1.2", "2.2", "3.1", "4.2"]),
        ("USA", ["1.2", "2.2", "3.3", "4.2"]),
        ("AMAP", ["1.1", "2.1", "3.1", "4.1"]),
        ("MFF", ["1.1", "2.1", "3.1", "4.1"]),
        ("WCPA", ["1.1", "2.1", "3.2", "4.1"]),
    ];

    for role in COUNTRIES.iter().chain(NGOS.iter()) {
        let prefs = preferred
            .iter()
            .find(|(r, _)| r == role)
            .map(|(_, p)| *p)
            .unwrap_or(["1.2", "2.2", "3.2", "4.2"]);
        let initial_stances = json!({
            "by_issue_id": {
                "ISSUE_1": {"preferred": prefs[0], "firmness": 0.6},
                "ISSUE_2": {"preferred": prefs[1], "firmness": 0.5},
                "ISSUE_3": {"preferred": prefs[2], "firmness": 0.5},
                "ISSUE_4": {"preferred": prefs[3], "firmness": 0.4},
            }
        });
        let first_text = format!(
            "The delegation of {} thanks the Chair. We come to this table ready to negotiate, \
             and we will judge every proposal against its practical burden and its benefit. \
             Our priority on emission limits is option {}.",
            role, prefs[0]
        );
        let second_text = format!(
            "On behalf of {}, we welcome all parties. Agreement is within reach if commitments \
             are matched by support, and we will engage constructively on every issue before us.",
            role
        );
        conn.execute(
            "INSERT INTO opening_variants (id, role_id, opening_text, initial_stances) VALUES (?1, ?2, ?3, ?4)",
            params![format!("{}-v1", role), role, first_text, initial_stances.to_string()],
        )?;
        conn.execute(
            "INSERT INTO opening_variants (id, role_id, opening_text, initial_stances) VALUES (?1, ?2, ?3, NULL)",
            params![format!("{}-v2", role), role, second_text],
        )?;
    }
    Ok(())
}

/// Install default seed rows into any empty seed table. Idempotent.
pub fn install_seed_data(db: &Database) -> Result<(), rusqlite::Error> {
    db.transaction(|tx| {
        if table_is_empty(tx, "japan_scripts")? {
            seed_japan_scripts(tx)?;
        }
        if table_is_empty(tx, "issue_definitions")? {
            seed_issue_definitions(tx)?;
        }
        if table_is_empty(tx, "opening_variants")? {
            seed_opening_variants(tx)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn seeded_db() -> Database {
        let db = Database::new(":memory:").expect("in-memory database should initialize");
        install_seed_data(&db).expect("seed data should install");
        db
    }

    #[test]
    fn unit_render_script_substitutes_and_tolerates_missing_template() {
        let rendered = render_script(Some("I recognize {speaker}."), &[("speaker", "USA")]);
        assert_eq!(rendered, "I recognize USA.");

        // unknown markers stay literal, missing template renders empty
        let untouched = render_script(Some("Hello {nobody}"), &[("speaker", "USA")]);
        assert_eq!(untouched, "Hello {nobody}");
        assert_eq!(render_script(None, &[]), "");
    }

    #[test]
    fn integration_seed_data_is_complete_and_idempotent() {
        let db = seeded_db();
        // second install is a no-op
        install_seed_data(&db).expect("reinstall should be a no-op");

        db.read(|conn| -> Result<(), rusqlite::Error> {
            for key in [R1_OPEN, R1_CALL_SPEAKER, ISSUE_INTRO, PROPOSAL, VOTE_RESULT_PASS, VOTE_RESULT_FAIL] {
                assert!(db::fetch_japan_script(conn, key)?.is_some(), "missing script {}", key);
            }

            let issues = db::fetch_issue_definitions(conn)?;
            assert_eq!(issues.len(), 4);
            let issue3 = issues.iter().find(|i| i.id == "3").expect("issue 3 should exist");
            let ids: Vec<&str> = issue3.options.iter().map(|o| o.option_id.as_str()).collect();
            assert_eq!(ids, vec!["3.1", "3.2", "3.3"]);

            let variants = db::fetch_opening_variants(conn)?;
            assert_eq!(variants.len(), 18);
            let usa: Vec<_> = variants.iter().filter(|v| v.role_id == "USA").collect();
            assert_eq!(usa.len(), 2);
            assert!(usa.iter().any(|v| v.initial_stances.is_some()));
            Ok(())
        })
        .expect("seeded tables should read back");
    }

    #[test]
    fn integration_render_japan_script_reads_from_table() {
        let db = seeded_db();
        let text = db
            .read(|conn| render_japan_script(conn, R1_CALL_SPEAKER, &[("speaker", "BRA")]))
            .expect("script should render");
        assert_eq!(text, "I recognize BRA for an opening statement.");

        let empty = db
            .read(|conn| render_japan_script(conn, "NOT_A_KEY", &[]))
            .expect("missing script should render empty");
        assert_eq!(empty, "");
    }
}
