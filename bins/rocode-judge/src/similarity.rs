//! Similarity scanner: flags likely-copied accepted submissions.
//!
//! Runs strictly after acceptance as an audit trail; it never blocks or
//! delays the submission's own result, and its failures are logged rather
//! than propagated.

use std::collections::HashSet;

use anyhow::Result;
use chrono::Utc;
use rocode_common::types::SimilarityFlag;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::SubmissionStore;

/// Submissions with fewer tokens than this are too trivial to compare -
/// every two-line solution looks like every other two-line solution.
pub const MIN_TOKEN_COUNT: usize = 20;

/// Combined score at or above this emits a flag.
pub const FLAG_THRESHOLD: f64 = 0.85;

const UNIGRAM_WEIGHT: f64 = 0.4;
const SHINGLE_WEIGHT: f64 = 0.6;
const SHINGLE_WIDTH: usize = 3;

/// Normalize Luau source into a flat token stream: comments stripped,
/// string literals collapsed to `STR`, numbers to `NUM`, lowercased words
/// and individual punctuation characters.
pub fn tokenize(code: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = code.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        // Comments: --[[ ... ]] blocks, then -- to end of line.
        if c == '-' && chars.get(i + 1) == Some(&'-') {
            if chars.get(i + 2) == Some(&'[') && chars.get(i + 3) == Some(&'[') {
                i += 4;
                while i < chars.len() {
                    if chars[i] == ']' && chars.get(i + 1) == Some(&']') {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            } else {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            continue;
        }

        // String literals collapse to one placeholder token.
        if c == '"' || c == '\'' {
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
            tokens.push("STR".to_string());
            continue;
        }

        // Number literals likewise.
        if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push("NUM".to_string());
            continue;
        }

        if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect::<String>().to_lowercase());
            continue;
        }

        if !c.is_whitespace() {
            tokens.push(c.to_string());
        }
        i += 1;
    }

    tokens
}

/// Scores are stored as fixed four-decimal strings so flag payloads
/// compare and display identically everywhere.
fn format_score(score: f64) -> String {
    format!("{score:.4}")
}

fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn shingles(tokens: &[String]) -> HashSet<String> {
    if tokens.len() < SHINGLE_WIDTH {
        return HashSet::new();
    }
    tokens
        .windows(SHINGLE_WIDTH)
        .map(|w| w.join(" "))
        .collect()
}

/// Weighted blend of unigram-set and 3-shingle-set Jaccard similarity.
/// Identical token streams score 1.0.
pub fn combined_score(tokens_a: &[String], tokens_b: &[String]) -> f64 {
    let set_a: HashSet<&str> = tokens_a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = tokens_b.iter().map(String::as_str).collect();
    let unigram = jaccard(&set_a, &set_b);

    let shingles_a = shingles(tokens_a);
    let shingles_b = shingles(tokens_b);
    let shingle_refs_a: HashSet<&str> = shingles_a.iter().map(String::as_str).collect();
    let shingle_refs_b: HashSet<&str> = shingles_b.iter().map(String::as_str).collect();
    let shingle = jaccard(&shingle_refs_a, &shingle_refs_b);

    UNIGRAM_WEIGHT * unigram + SHINGLE_WEIGHT * shingle
}

/// Compare an accepted submission against the recent accepted submissions
/// for the same problem and record a flag for each close match. Returns the
/// number of flags emitted.
pub async fn scan(
    store: &mut SubmissionStore,
    problem_id: Uuid,
    submission_id: Uuid,
    code: &str,
) -> Result<usize> {
    let tokens = tokenize(code);
    if tokens.len() < MIN_TOKEN_COUNT {
        debug!(
            submission_id = %submission_id,
            token_count = tokens.len(),
            "Submission below token floor, skipping similarity scan"
        );
        return Ok(0);
    }

    let candidates = store.recent_accepted(problem_id).await?;
    let mut flagged = 0;

    for candidate in candidates {
        if candidate.submission_id == submission_id {
            continue;
        }

        let other_tokens = tokenize(&candidate.code);
        if other_tokens.len() < MIN_TOKEN_COUNT {
            continue;
        }

        let score = combined_score(&tokens, &other_tokens);
        if score >= FLAG_THRESHOLD {
            info!(
                submission_id = %submission_id,
                matched = %candidate.submission_id,
                score,
                "Similarity flag emitted"
            );
            store
                .push_flag(&SimilarityFlag {
                    submission_id,
                    matched_submission_id: candidate.submission_id,
                    score: format_score(score),
                    flagged_at: Utc::now(),
                })
                .await?;
            flagged += 1;
        }
    }

    Ok(flagged)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOLUTION: &str = r#"
        local nums = readnumbers()
        local total = 0
        for i, v in ipairs(nums) do
            total = total + v
        end
        print(total)
    "#;

    #[test]
    fn tokenize_strips_comments() {
        let code = "-- a comment\nlocal x = 1 --[[ block\ncomment ]] local y = 2";
        let tokens = tokenize(code);
        assert!(!tokens.iter().any(|t| t == "comment"));
        assert!(tokens.iter().any(|t| t == "local"));
        assert!(tokens.iter().any(|t| t == "y"));
    }

    #[test]
    fn tokenize_collapses_literals() {
        let tokens = tokenize(r#"local s = "some text" local n = 42.5"#);
        assert!(tokens.contains(&"STR".to_string()));
        assert!(tokens.contains(&"NUM".to_string()));
        assert!(!tokens.iter().any(|t| t.contains("some")));
        assert!(!tokens.iter().any(|t| t.contains("42")));
    }

    #[test]
    fn tokenize_lowercases_identifiers() {
        let tokens = tokenize("local MyValue = OtherThing");
        assert!(tokens.contains(&"myvalue".to_string()));
        assert!(tokens.contains(&"otherthing".to_string()));
    }

    #[test]
    fn identical_sources_score_one() {
        let tokens = tokenize(SOLUTION);
        assert!(tokens.len() >= MIN_TOKEN_COUNT);
        let score = combined_score(&tokens, &tokens);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn renamed_variables_still_score_high() {
        // Literal-collapsing plus structure shingles should see through a
        // pure rename.
        let renamed = SOLUTION.replace("total", "acc").replace("nums", "xs");
        let score = combined_score(&tokenize(SOLUTION), &tokenize(&renamed));
        assert!(score > 0.4, "score was {score}");
    }

    #[test]
    fn unrelated_sources_score_low() {
        let other = r#"
            local grid = {}
            for row = 1, 10 do
                grid[row] = {}
                for col = 1, 10 do
                    grid[row][col] = row * col
                end
            end
            print(grid[3][7])
        "#;
        let score = combined_score(&tokenize(SOLUTION), &tokenize(other));
        assert!(score < FLAG_THRESHOLD, "score was {score}");
    }

    #[test]
    fn scores_are_fixed_four_decimal_strings() {
        assert_eq!(format_score(1.0), "1.0000");
        assert_eq!(format_score(0.85), "0.8500");
        assert_eq!(format_score(0.123456), "0.1235");
    }

    #[test]
    fn short_sources_fall_below_token_floor() {
        assert!(tokenize("print(1)").len() < MIN_TOKEN_COUNT);
    }
}
