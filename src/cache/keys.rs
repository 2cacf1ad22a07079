//! Canonical cache keys
//!
//! Keys are colon-separated, category first: `roster:<league>`,
//! `matchup:<league>:<week>`. Invalidation patterns and the metrics key
//! distribution both rely on this shape.

pub fn state(sport: &str) -> String {
    format!("state:{}", sport)
}

pub fn players(sport: &str) -> String {
    format!("players:{}", sport)
}

pub fn player(player_id: &str) -> String {
    format!("player:{}", player_id)
}

pub fn trending(sport: &str, kind: &str) -> String {
    format!("trending:{}:{}", sport, kind)
}

pub fn league(league_id: &str) -> String {
    format!("league:{}", league_id)
}

pub fn roster(league_id: &str) -> String {
    format!("roster:{}", league_id)
}

pub fn users(league_id: &str) -> String {
    format!("users:{}", league_id)
}

pub fn matchup(league_id: &str, week: u32) -> String {
    format!("matchup:{}:{}", league_id, week)
}

pub fn transactions(league_id: &str, week: u32) -> String {
    format!("transactions:{}:{}", league_id, week)
}

pub fn bracket(league_id: &str, kind: &str) -> String {
    format!("bracket:{}:{}", league_id, kind)
}

/// Patterns covering every entity-scoped key of one league
pub fn league_patterns(league_id: &str) -> Vec<String> {
    let id = regex::escape(league_id);
    ["roster", "users", "matchup", "transactions", "bracket", "league"]
        .iter()
        .map(|category| format!("^{}:{}(:|$)", category, id))
        .collect()
}

/// First two colon segments, used to group keys in metrics
pub fn group(key: &str) -> String {
    key.splitn(3, ':').take(2).collect::<Vec<_>>().join(":")
}
