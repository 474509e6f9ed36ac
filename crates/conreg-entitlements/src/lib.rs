use anyhow::Result;
use chrono::{DateTime, Utc};
use conreg_core::Membership;
use serde::{Deserialize, Serialize};

/// The three process-wide award-cycle instants. Injected into the ledger as
/// explicit parameters; the ledger itself never reads a clock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AwardCycle {
    pub nomination_opens_at: DateTime<Utc>,
    pub voting_opens_at: DateTime<Utc>,
    pub voting_closes_at: DateTime<Utc>,
}

impl AwardCycle {
    pub fn new(
        nomination_opens_at: DateTime<Utc>,
        voting_opens_at: DateTime<Utc>,
        voting_closes_at: DateTime<Utc>,
    ) -> Result<Self> {
        if nomination_opens_at > voting_opens_at || voting_opens_at > voting_closes_at {
            anyhow::bail!(
                "award cycle instants must be ordered: nomination opens, voting opens, voting closes"
            );
        }
        Ok(Self {
            nomination_opens_at,
            voting_opens_at,
            voting_closes_at,
        })
    }
}

/// Rights that become visible over time. Identifiers distinguish a right
/// that's currently usable from one that's coming soon, and the current
/// award from the retrospective one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Right {
    Attend,
    SiteSelection,
    HugoNominateSoon,
    RetroHugoNominateSoon,
    HugoNominateOnly,
    RetroHugoNominateOnly,
    HugoNominate,
    RetroHugoNominate,
    HugoVote,
    RetroHugoVote,
}

impl Right {
    pub fn as_str(&self) -> &'static str {
        match self {
            Right::Attend => "rights.attend",
            Right::SiteSelection => "rights.site_selection",
            Right::HugoNominateSoon => "rights.hugo.nominate_soon",
            Right::RetroHugoNominateSoon => "rights.retro_hugo.nominate_soon",
            Right::HugoNominateOnly => "rights.hugo.nominate_only",
            Right::RetroHugoNominateOnly => "rights.retro_hugo.nominate_only",
            Right::HugoNominate => "rights.hugo.nominate",
            Right::RetroHugoNominate => "rights.retro_hugo.nominate",
            Right::HugoVote => "rights.hugo.vote",
            Right::RetroHugoVote => "rights.retro_hugo.vote",
        }
    }
}

pub fn can_nominate(held: &[Membership]) -> bool {
    held.iter().any(|membership| membership.can_nominate)
}

pub fn can_vote(held: &[Membership]) -> bool {
    held.iter().any(|membership| membership.can_vote)
}

/// Rights conferred by a reservation, derived from every tier ever held
/// through its orders. Upgrades only add capabilities, so historical tiers
/// count alongside the active one.
///
/// Award phases are half-open windows on `now`:
/// before nominations open the capability shows as "coming soon"; between
/// nominations opening and voting opening it is nominate (or nominate-only
/// for tiers that cannot vote); between voting opening and closing it is
/// vote; after close no award rights remain.
pub fn active_rights(held: &[Membership], now: DateTime<Utc>, cycle: &AwardCycle) -> Vec<Right> {
    let mut rights = Vec::new();

    if held.iter().any(|membership| membership.can_attend) {
        rights.push(Right::Attend);
    }
    if held.iter().any(|membership| membership.can_site_select) {
        rights.push(Right::SiteSelection);
    }

    if now < cycle.nomination_opens_at {
        if can_nominate(held) {
            rights.push(Right::HugoNominateSoon);
            rights.push(Right::RetroHugoNominateSoon);
        }
    } else if now < cycle.voting_opens_at {
        if can_nominate(held) && !can_vote(held) {
            rights.push(Right::HugoNominateOnly);
            rights.push(Right::RetroHugoNominateOnly);
        } else if can_nominate(held) {
            rights.push(Right::HugoNominate);
            rights.push(Right::RetroHugoNominate);
        }
    } else if now < cycle.voting_closes_at && can_vote(held) {
        rights.push(Right::HugoVote);
        rights.push(Right::RetroHugoVote);
    }

    rights
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn tier(name: &str, can_attend: bool, can_nominate: bool, can_vote: bool) -> Membership {
        Membership {
            id: Uuid::new_v4(),
            name: name.to_string(),
            price_cents: 0,
            can_attend,
            can_site_select: can_attend,
            can_nominate,
            can_vote,
            active_from: Utc::now() - Duration::days(30),
            active_to: None,
            display_order: 0,
        }
    }

    fn cycle(now: DateTime<Utc>) -> AwardCycle {
        AwardCycle::new(
            now + Duration::days(10),
            now + Duration::days(40),
            now + Duration::days(70),
        )
        .unwrap()
    }

    #[test]
    fn rejects_unordered_cycle_instants() {
        let now = Utc::now();
        assert!(AwardCycle::new(now + Duration::days(2), now, now + Duration::days(3)).is_err());
    }

    #[test]
    fn tier_without_nomination_grants_no_award_rights_at_any_phase() {
        let now = Utc::now();
        let cycle = cycle(now);
        let held = vec![tier("kid_in_tow", true, false, false)];

        for probe in [
            now,
            cycle.nomination_opens_at + Duration::days(1),
            cycle.voting_opens_at + Duration::days(1),
            cycle.voting_closes_at + Duration::days(1),
        ] {
            let rights = active_rights(&held, probe, &cycle);
            assert_eq!(rights, vec![Right::Attend, Right::SiteSelection]);
        }
    }

    #[test]
    fn nominating_tier_before_opening_shows_coming_soon() {
        let now = Utc::now();
        let cycle = cycle(now);
        let held = vec![tier("supporting", false, true, true)];

        let rights = active_rights(&held, now, &cycle);
        assert_eq!(
            rights,
            vec![Right::HugoNominateSoon, Right::RetroHugoNominateSoon]
        );
    }

    #[test]
    fn nomination_window_distinguishes_nominate_only() {
        let now = Utc::now();
        let cycle = cycle(now);
        let probe = cycle.nomination_opens_at;

        let nominate_only = vec![tier("silver_fern", true, true, false)];
        assert_eq!(
            active_rights(&nominate_only, probe, &cycle),
            vec![
                Right::Attend,
                Right::SiteSelection,
                Right::HugoNominateOnly,
                Right::RetroHugoNominateOnly,
            ]
        );

        let full = vec![tier("adult", true, true, true)];
        assert_eq!(
            active_rights(&full, probe, &cycle),
            vec![
                Right::Attend,
                Right::SiteSelection,
                Right::HugoNominate,
                Right::RetroHugoNominate,
            ]
        );
    }

    #[test]
    fn voting_window_grants_vote_until_close() {
        let now = Utc::now();
        let cycle = cycle(now);
        let held = vec![tier("supporting", false, true, true)];

        let rights = active_rights(&held, cycle.voting_opens_at, &cycle);
        assert_eq!(rights, vec![Right::HugoVote, Right::RetroHugoVote]);

        let rights = active_rights(&held, cycle.voting_closes_at, &cycle);
        assert!(rights.is_empty());
    }

    #[test]
    fn upgrading_adds_rights_without_removing_held_ones() {
        let now = Utc::now();
        let cycle = cycle(now);
        let probe = cycle.nomination_opens_at;

        let mut held = vec![tier("child", true, false, false)];
        assert_eq!(
            active_rights(&held, probe, &cycle),
            vec![Right::Attend, Right::SiteSelection]
        );

        // Rights are derived live from the set of tiers ever held.
        held.push(tier("adult", true, true, true));
        assert_eq!(
            active_rights(&held, probe, &cycle),
            vec![
                Right::Attend,
                Right::SiteSelection,
                Right::HugoNominate,
                Right::RetroHugoNominate,
            ]
        );
    }
}
