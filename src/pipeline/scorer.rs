use std::collections::HashMap;

use crate::core::types::{LinkRecord, ThreatStatus};

/// Links sharing a content fingerprint at least this often count as templated.
pub const TEMPLATE_MIN_COPIES: usize = 3;

/// Recompute the spam score of every record that has at least one usable
/// signal. Records with no signal keep whatever score they already had.
pub fn score_links(records: &mut [LinkRecord]) {
    let mut copies: HashMap<String, usize> = HashMap::new();
    for r in records.iter() {
        if let Some(fp) = &r.content_fingerprint {
            *copies.entry(fp.clone()).or_insert(0) += 1;
        }
    }
    for r in records.iter_mut() {
        let template_copies = r
            .content_fingerprint
            .as_ref()
            .and_then(|fp| copies.get(fp))
            .copied()
            .unwrap_or(0);
        if let Some(score) = spam_score(r, template_copies) {
            r.spam_score = Some(score);
        }
    }
}

pub fn spam_score(record: &LinkRecord, template_copies: usize) -> Option<u8> {
    let mut known = false;
    let mut score: u32 = 0;

    match record.threat_status {
        ThreatStatus::Flagged => {
            known = true;
            score += 45;
        }
        ThreatStatus::Clean => known = true,
        ThreatStatus::Unknown => {}
    }

    if let Some(days) = record.domain_age_days {
        known = true;
        score += match days {
            d if d < 30 => 25,
            d if d < 180 => 15,
            d if d < 365 => 5,
            _ => 0,
        };
        if record.registrar.is_none() {
            score += 5;
        }
    }

    if let Some(rank) = record.authority_rank {
        known = true;
        score += match rank {
            r if r < 10 => 10,
            r if r < 20 => 5,
            _ => 0,
        };
    }

    if template_copies >= TEMPLATE_MIN_COPIES {
        known = true;
        score += 15;
    }

    if record.link_count > 50 {
        score += 10;
    } else if record.link_count > 10 {
        score += 5;
    }

    if known {
        Some(score.min(100) as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(url: &str) -> LinkRecord {
        LinkRecord::new("example.com", url, "t1")
    }

    #[test]
    fn no_signal_means_no_score() {
        assert_eq!(spam_score(&link("https://a.net/"), 0), None);
    }

    #[test]
    fn young_flagged_templated_link_scores_high() {
        let mut r = link("https://a.net/");
        r.threat_status = ThreatStatus::Flagged;
        r.domain_age_days = Some(10);
        r.authority_rank = Some(3);
        r.link_count = 80;
        assert_eq!(spam_score(&r, 4), Some(100));
    }

    #[test]
    fn old_clean_domain_scores_zero() {
        let mut r = link("https://a.net/");
        r.threat_status = ThreatStatus::Clean;
        r.domain_age_days = Some(4000);
        r.registrar = Some("MarkMonitor".into());
        r.authority_rank = Some(70);
        assert_eq!(spam_score(&r, 1), Some(0));
    }

    #[test]
    fn templated_copies_are_detected_across_the_task() {
        let mut records: Vec<LinkRecord> = (0..3)
            .map(|i| {
                let mut r = link(&format!("https://farm{i}.net/"));
                r.content_fingerprint = Some("same".into());
                r
            })
            .collect();
        let mut lone = link("https://lone.net/");
        lone.content_fingerprint = Some("other".into());
        lone.spam_score = Some(33);
        records.push(lone);
        score_links(&mut records);
        assert!(records[..3].iter().all(|r| r.spam_score == Some(15)));
        assert_eq!(records[3].spam_score, Some(33));
    }

    #[test]
    fn rescoring_is_stable() {
        let mut records = vec![link("https://a.net/")];
        records[0].domain_age_days = Some(100);
        score_links(&mut records);
        let first = records[0].spam_score;
        score_links(&mut records);
        assert_eq!(records[0].spam_score, first);
        assert_eq!(first, Some(20));
    }
}
