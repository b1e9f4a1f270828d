//! Profile and trust graph with display-name resolution
//!
//! Profiles live in one map keyed by feed id; every cross reference
//! (assignments, primary and secondaries) is a key into that map.
//!
//! ## Name resolution
//!
//! Each identity resolves to one display name with a rank:
//!
//! | Source                                   | Rank |
//! |------------------------------------------|------|
//! | confirmed primary identity's name        | primary's rank |
//! | the local identity itself                | 1    |
//! | name assigned by the local identity      | 1    |
//! | name assigned by a trusted identity      | 0.5  |
//! | self-assigned name or short id           | 0    |
//!
//! `ids` maps a display name back to the identity holding it. A claim on a
//! taken name succeeds when its rank is at least the holder's, so among equal
//! ranks the most recent resolution wins.

use crate::links::short_id;
use crate::message::{AliasRole, ContactContent, FieldUpdate, Trust};
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfAssigned {
    pub name: Option<String>,
    pub profile_pic: Option<JsonValue>,
}

/// What one identity asserted about another
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub name: Option<String>,
    pub profile_pic: Option<JsonValue>,
    pub alias: Option<AliasRole>,
    pub following: Option<bool>,
}

impl Assignment {
    fn apply(&mut self, contact: &ContactContent) {
        if let Some(name) = &contact.name {
            self.name = Some(sanitize_name(name));
        }
        match &contact.profile_pic {
            Some(FieldUpdate::Set(pic)) => self.profile_pic = Some(pic.clone()),
            Some(FieldUpdate::Clear) => self.profile_pic = None,
            None => {}
        }
        match contact.alias {
            Some(FieldUpdate::Set(role)) => self.alias = Some(role),
            Some(FieldUpdate::Clear) => self.alias = None,
            None => {}
        }
        if let Some(following) = contact.following {
            self.following = Some(following);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub created_at: Option<i64>,
    #[serde(rename = "self")]
    pub self_assigned: SelfAssigned,
    pub assigned_by: BTreeMap<String, Assignment>,
    pub assigned_to: BTreeMap<String, Assignment>,
    pub primary: Option<String>,
    pub secondaries: BTreeSet<String>,
    /// Trust as asserted by the local identity
    pub trust: Trust,
}

impl Profile {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            created_at: None,
            self_assigned: SelfAssigned::default(),
            assigned_by: BTreeMap::new(),
            assigned_to: BTreeMap::new(),
            primary: None,
            secondaries: BTreeSet::new(),
            trust: Trust::Neutral,
        }
    }

    /// Whether this identity currently follows `id`
    pub fn follows(&self, id: &str) -> bool {
        self.assigned_to
            .get(id)
            .and_then(|a| a.following)
            .unwrap_or(false)
    }
}

/// Confidence in a resolved display name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NameRank {
    Untrusted,
    Endorsed,
    Trusted,
}

impl NameRank {
    pub fn value(self) -> f64 {
        match self {
            NameRank::Untrusted => 0.0,
            NameRank::Endorsed => 0.5,
            NameRank::Trusted => 1.0,
        }
    }
}

impl Serialize for NameRank {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    ConfirmAlias,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionItem {
    pub secondary_id: String,
    pub action: ActionKind,
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct ProfileGraph {
    local_id: String,
    profiles: HashMap<String, Profile>,
    names: HashMap<String, String>,
    ids: HashMap<String, String>,
    ranks: HashMap<String, NameRank>,
    // Resolution counter per identity, breaks rank ties on re-election
    resolved_at: HashMap<String, u64>,
    resolutions: u64,
    trusted: BTreeSet<String>,
    action_items: BTreeMap<String, ActionItem>,
    max_alias_depth: usize,
}

impl ProfileGraph {
    pub fn new(local_id: impl Into<String>, max_alias_depth: usize) -> Self {
        let local_id = local_id.into();
        let mut profiles = HashMap::new();
        profiles.insert(local_id.clone(), Profile::new(&local_id));

        Self {
            local_id,
            profiles,
            names: HashMap::new(),
            ids: HashMap::new(),
            ranks: HashMap::new(),
            resolved_at: HashMap::new(),
            resolutions: 0,
            trusted: BTreeSet::new(),
            action_items: BTreeMap::new(),
            max_alias_depth,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.get(id)
    }

    pub fn local_profile(&self) -> Option<&Profile> {
        self.profiles.get(&self.local_id)
    }

    pub fn profiles(&self) -> &HashMap<String, Profile> {
        &self.profiles
    }

    pub fn names(&self) -> &HashMap<String, String> {
        &self.names
    }

    pub fn ids(&self) -> &HashMap<String, String> {
        &self.ids
    }

    pub fn ranks(&self) -> &HashMap<String, NameRank> {
        &self.ranks
    }

    pub fn name(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn id_by_name(&self, name: &str) -> Option<&str> {
        self.ids.get(name).map(String::as_str)
    }

    pub fn rank(&self, id: &str) -> Option<NameRank> {
        self.ranks.get(id).copied()
    }

    pub fn trusted(&self) -> &BTreeSet<String> {
        &self.trusted
    }

    pub fn action_items(&self) -> &BTreeMap<String, ActionItem> {
        &self.action_items
    }

    /// Whether the local identity follows `id`
    pub fn local_follows(&self, id: &str) -> bool {
        self.local_profile().map(|p| p.follows(id)).unwrap_or(false)
    }

    fn ensure(&mut self, id: &str) -> &mut Profile {
        self.profiles
            .entry(id.to_string())
            .or_insert_with(|| Profile::new(id))
    }

    // ========================================================================
    // Updates
    // ========================================================================

    pub fn apply_init(&mut self, author: &str, timestamp: i64) {
        self.ensure(author).created_at = Some(timestamp);
    }

    pub fn apply_contact(&mut self, author: &str, contact: &ContactContent) {
        self.ensure(author);
        for target in &contact.targets {
            if target == author {
                self.update_self(author, contact);
            } else {
                self.update_other(author, target, contact);
            }
            self.update_action_items(target);
        }
        self.update_action_items(author);
    }

    fn update_self(&mut self, id: &str, contact: &ContactContent) {
        let profile = self.ensure(id);
        if let Some(name) = &contact.name {
            profile.self_assigned.name = Some(sanitize_name(name));
        }
        match &contact.profile_pic {
            Some(FieldUpdate::Set(pic)) => profile.self_assigned.profile_pic = Some(pic.clone()),
            Some(FieldUpdate::Clear) => profile.self_assigned.profile_pic = None,
            None => {}
        }

        if contact.name.is_some() {
            self.rebuild_names_for(id);
        }
    }

    fn update_other(&mut self, source: &str, target: &str, contact: &ContactContent) {
        self.ensure(source)
            .assigned_to
            .entry(target.to_string())
            .or_default()
            .apply(contact);
        self.ensure(target)
            .assigned_by
            .entry(source.to_string())
            .or_default()
            .apply(contact);

        // Only the local identity's trust assertions count
        if let Some(trust) = contact.trust {
            if source == self.local_id {
                self.ensure(target).trust = trust;
                if trust == Trust::Trusted {
                    self.trusted.insert(target.to_string());
                } else {
                    self.trusted.remove(target);
                }
                self.rebuild_names_by(target);
            }
        }

        if contact.name.is_some() {
            self.rebuild_names_for(target);
        }

        if contact.alias.is_some() {
            self.update_aliases(source, target);
            self.rebuild_names_for(source);
            self.rebuild_names_for(target);
        }
    }

    /// Re-evaluate the alias link between `a` and `b` in both directions
    fn update_aliases(&mut self, a: &str, b: &str) {
        self.resolve_alias_pair(a, b);
        self.resolve_alias_pair(b, a);
    }

    fn alias_of(&self, from: &str, to: &str) -> Option<AliasRole> {
        self.profiles.get(from)?.assigned_to.get(to)?.alias
    }

    fn resolve_alias_pair(&mut self, secondary: &str, primary: &str) {
        let confirmed = self.alias_of(secondary, primary) == Some(AliasRole::Primary)
            && self.alias_of(primary, secondary) == Some(AliasRole::Secondary);

        if confirmed {
            let previous = self.ensure(secondary).primary.replace(primary.to_string());
            if let Some(previous) = previous.filter(|p| p != primary) {
                self.ensure(&previous).secondaries.remove(secondary);
            }
            self.ensure(primary).secondaries.insert(secondary.to_string());
        } else {
            let profile = self.ensure(secondary);
            if profile.primary.as_deref() == Some(primary) {
                profile.primary = None;
            }
            self.ensure(primary).secondaries.remove(secondary);
        }
    }

    fn update_action_items(&mut self, target: &str) {
        if target == self.local_id {
            return;
        }

        let wants_confirmation = self
            .profiles
            .get(target)
            .map(|t| {
                t.trust != Trust::Flagged
                    && t.assigned_to.get(&self.local_id).and_then(|a| a.alias)
                        == Some(AliasRole::Primary)
            })
            .unwrap_or(false);
        let confirmed = self
            .local_profile()
            .map(|me| me.secondaries.contains(target))
            .unwrap_or(false);

        if wants_confirmation && !confirmed {
            self.action_items.insert(
                target.to_string(),
                ActionItem {
                    secondary_id: target.to_string(),
                    action: ActionKind::ConfirmAlias,
                },
            );
        } else {
            self.action_items.remove(target);
        }
    }

    // ========================================================================
    // Name resolution
    // ========================================================================

    /// Re-resolve `id`, then every identity whose name derives from it
    pub fn rebuild_names_for(&mut self, id: &str) {
        let mut visited = HashSet::new();
        self.resolve_cascade(id, &mut visited, 0);
    }

    /// Re-resolve every identity `id` has assigned something to
    pub fn rebuild_names_by(&mut self, id: &str) {
        let targets: Vec<String> = self
            .profiles
            .get(id)
            .map(|p| p.assigned_to.keys().cloned().collect())
            .unwrap_or_default();
        for target in targets {
            self.rebuild_names_for(&target);
        }
    }

    fn resolve_cascade(&mut self, id: &str, visited: &mut HashSet<String>, depth: usize) {
        if depth > self.max_alias_depth || !visited.insert(id.to_string()) {
            debug!(id = %id, depth, "Alias chain revisited, stopping");
            return;
        }

        self.resolve_one(id, visited, depth);

        let secondaries: Vec<String> = self
            .profiles
            .get(id)
            .map(|p| p.secondaries.iter().cloned().collect())
            .unwrap_or_default();
        for secondary in secondaries {
            self.resolve_cascade(&secondary, visited, depth + 1);
        }
    }

    fn resolve_one(&mut self, id: &str, visited: &mut HashSet<String>, depth: usize) {
        let Some(profile) = self.profiles.get(id) else {
            return;
        };
        let own = profile
            .self_assigned
            .name
            .clone()
            .unwrap_or_else(|| short_id(id));

        if let Some(primary) = profile.primary.clone() {
            if !self.names.contains_key(&primary)
                && depth < self.max_alias_depth
                && visited.insert(primary.clone())
            {
                self.resolve_one(&primary, visited, depth + 1);
            }
            if let Some(primary_name) = self.names.get(&primary) {
                let name = format!("{} ({})", primary_name, own);
                let rank = self.rank(&primary).unwrap_or(NameRank::Untrusted);
                self.store_name(id, name, rank);
                return;
            }
        }

        let (name, rank) = self
            .assigned_name(id)
            .unwrap_or((own, NameRank::Untrusted));
        self.store_name(id, name, rank);
    }

    fn assigned_name(&self, id: &str) -> Option<(String, NameRank)> {
        let profile = self.profiles.get(id)?;

        if id == self.local_id {
            let own = profile
                .self_assigned
                .name
                .clone()
                .unwrap_or_else(|| short_id(id));
            return Some((own, NameRank::Trusted));
        }

        if let Some(name) = profile
            .assigned_by
            .get(&self.local_id)
            .and_then(|a| a.name.clone())
        {
            return Some((name, NameRank::Trusted));
        }

        profile
            .assigned_by
            .iter()
            .filter(|(by, _)| self.trusted.contains(*by))
            .find_map(|(_, a)| a.name.clone())
            .map(|name| (name, NameRank::Endorsed))
    }

    fn store_name(&mut self, id: &str, name: String, rank: NameRank) {
        self.resolutions += 1;
        self.resolved_at.insert(id.to_string(), self.resolutions);
        self.ranks.insert(id.to_string(), rank);

        let previous = self.names.insert(id.to_string(), name.clone());
        if let Some(old) = previous.filter(|old| *old != name) {
            if self.ids.get(&old).map(String::as_str) == Some(id) {
                self.ids.remove(&old);
                self.reelect(&old);
            }
        }

        let claims = match self.ids.get(&name) {
            None => true,
            Some(holder) if holder == id => true,
            Some(holder) => rank >= self.rank(holder).unwrap_or(NameRank::Untrusted),
        };
        if claims {
            self.ids.insert(name, id.to_string());
        }
    }

    // A vacated name goes to the best remaining claimant by rank, then recency
    fn reelect(&mut self, name: &str) {
        let winner = self
            .names
            .iter()
            .filter(|(_, n)| n.as_str() == name)
            .map(|(id, _)| id)
            .max_by_key(|id| {
                (
                    self.ranks.get(*id).copied().unwrap_or(NameRank::Untrusted),
                    self.resolved_at.get(*id).copied().unwrap_or(0),
                )
            })
            .cloned();

        if let Some(winner) = winner {
            self.ids.insert(name.to_string(), winner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::feed_id;

    fn id(seed: u8) -> String {
        feed_id(&[seed; 32])
    }

    fn contact(target: &str) -> ContactContent {
        ContactContent {
            targets: vec![target.to_string()],
            ..Default::default()
        }
    }

    fn named(target: &str, name: &str) -> ContactContent {
        ContactContent {
            name: Some(name.to_string()),
            ..contact(target)
        }
    }

    fn alias(target: &str, role: AliasRole) -> ContactContent {
        ContactContent {
            alias: Some(FieldUpdate::Set(role)),
            ..contact(target)
        }
    }

    fn trust(target: &str, trust: Trust) -> ContactContent {
        ContactContent {
            trust: Some(trust),
            ..contact(target)
        }
    }

    #[test]
    fn test_local_self_name() {
        let me = id(0);
        let mut graph = ProfileGraph::new(me.clone(), 16);
        graph.apply_contact(&me, &named(&me, "zed"));

        assert_eq!(graph.name(&me), Some("zed"));
        assert_eq!(graph.id_by_name("zed"), Some(me.as_str()));
        assert_eq!(graph.rank(&me), Some(NameRank::Trusted));
    }

    #[test]
    fn test_name_collisions() {
        let me = id(0);
        let alice = id(1);
        let carol = id(3);
        let mut graph = ProfileGraph::new(me.clone(), 16);

        graph.apply_contact(&alice, &named(&alice, "bob"));
        assert_eq!(graph.id_by_name("bob"), Some(alice.as_str()));

        // Equal rank: most recent resolution wins
        graph.apply_contact(&carol, &named(&carol, "bob"));
        assert_eq!(graph.id_by_name("bob"), Some(carol.as_str()));

        // Local assignment outranks self-assertions
        graph.apply_contact(&me, &named(&alice, "bob"));
        assert_eq!(graph.rank(&alice), Some(NameRank::Trusted));
        assert_eq!(graph.id_by_name("bob"), Some(alice.as_str()));

        graph.apply_contact(&carol, &named(&carol, "bob"));
        assert_eq!(graph.id_by_name("bob"), Some(alice.as_str()));
        assert_eq!(graph.name(&carol), Some("bob"));
    }

    #[test]
    fn test_rename_releases_old_name() {
        let me = id(0);
        let alice = id(1);
        let carol = id(3);
        let mut graph = ProfileGraph::new(me, 16);

        graph.apply_contact(&alice, &named(&alice, "bob"));
        graph.apply_contact(&carol, &named(&carol, "bob"));
        graph.apply_contact(&carol, &named(&carol, "carol"));

        assert_eq!(graph.id_by_name("carol"), Some(carol.as_str()));
        assert_eq!(graph.id_by_name("bob"), Some(alice.as_str()));
    }

    #[test]
    fn test_trusted_assigner_endorses_name() {
        let me = id(0);
        let carol = id(3);
        let dave = id(4);
        let mut graph = ProfileGraph::new(me.clone(), 16);

        graph.apply_contact(&carol, &named(&dave, "dan"));
        assert_eq!(graph.name(&dave), Some(short_id(&dave).as_str()));
        assert_eq!(graph.rank(&dave), Some(NameRank::Untrusted));

        graph.apply_contact(&me, &trust(&carol, Trust::Trusted));
        assert!(graph.trusted().contains(&carol));
        assert_eq!(graph.name(&dave), Some("dan"));
        assert_eq!(graph.rank(&dave), Some(NameRank::Endorsed));

        graph.apply_contact(&me, &trust(&carol, Trust::Neutral));
        assert!(!graph.trusted().contains(&carol));
        assert_eq!(graph.rank(&dave), Some(NameRank::Untrusted));
    }

    #[test]
    fn test_trust_from_others_ignored() {
        let me = id(0);
        let alice = id(1);
        let bob = id(2);
        let mut graph = ProfileGraph::new(me, 16);

        graph.apply_contact(&alice, &trust(&bob, Trust::Flagged));
        assert_eq!(graph.profile(&bob).unwrap().trust, Trust::Neutral);
        assert!(graph.profile(&bob).unwrap().assigned_by.contains_key(&alice));
    }

    #[test]
    fn test_alias_confirmation() {
        let me = id(0);
        let laptop = id(5);
        let mut graph = ProfileGraph::new(me.clone(), 16);
        graph.apply_contact(&me, &named(&me, "zed"));
        graph.apply_contact(&laptop, &named(&laptop, "lap"));

        graph.apply_contact(&laptop, &alias(&me, AliasRole::Primary));
        let item = graph.action_items().get(&laptop).unwrap();
        assert_eq!(item.secondary_id, laptop);
        assert_eq!(item.action, ActionKind::ConfirmAlias);
        assert_eq!(graph.profile(&laptop).unwrap().primary, None);

        graph.apply_contact(&me, &alias(&laptop, AliasRole::Secondary));
        assert!(graph.action_items().is_empty());
        assert!(graph.local_profile().unwrap().secondaries.contains(&laptop));
        assert_eq!(graph.profile(&laptop).unwrap().primary.as_deref(), Some(me.as_str()));
        assert_eq!(graph.name(&laptop), Some("zed (lap)"));
        assert_eq!(graph.rank(&laptop), Some(NameRank::Trusted));
    }

    #[test]
    fn test_alias_withdrawn_clears_link() {
        let me = id(0);
        let laptop = id(5);
        let mut graph = ProfileGraph::new(me.clone(), 16);

        graph.apply_contact(&laptop, &alias(&me, AliasRole::Primary));
        graph.apply_contact(&me, &alias(&laptop, AliasRole::Secondary));
        assert!(graph.local_profile().unwrap().secondaries.contains(&laptop));

        let withdraw = ContactContent {
            alias: Some(FieldUpdate::Clear),
            ..contact(&me)
        };
        graph.apply_contact(&laptop, &withdraw);
        assert!(graph.local_profile().unwrap().secondaries.is_empty());
        assert_eq!(graph.profile(&laptop).unwrap().primary, None);
        assert_eq!(graph.name(&laptop), Some(short_id(&laptop).as_str()));
    }

    #[test]
    fn test_flagged_identity_gets_no_action_item() {
        let me = id(0);
        let troll = id(6);
        let mut graph = ProfileGraph::new(me.clone(), 16);

        graph.apply_contact(&me, &trust(&troll, Trust::Flagged));
        graph.apply_contact(&troll, &alias(&me, AliasRole::Primary));
        assert!(graph.action_items().is_empty());
    }

    #[test]
    fn test_alias_cycle_terminates() {
        let me = id(0);
        let a = id(1);
        let b = id(2);
        let c = id(3);
        let mut graph = ProfileGraph::new(me, 4);

        // a -> b -> c -> a, each pair confirmed
        for (secondary, primary) in [(&a, &b), (&b, &c), (&c, &a)] {
            graph.apply_contact(secondary, &alias(primary, AliasRole::Primary));
            graph.apply_contact(primary, &alias(secondary, AliasRole::Secondary));
        }

        assert_eq!(graph.profile(&a).unwrap().primary.as_deref(), Some(b.as_str()));
        assert_eq!(graph.profile(&c).unwrap().primary.as_deref(), Some(a.as_str()));
        for who in [&a, &b, &c] {
            assert!(graph.name(who).is_some());
        }
    }

    #[test]
    fn test_profile_pic_and_init() {
        let me = id(0);
        let alice = id(1);
        let mut graph = ProfileGraph::new(me, 16);
        let pic = serde_json::json!({ "ext": crate::links::blob_id(b"face") });

        graph.apply_init(&alice, 42);
        graph.apply_contact(
            &alice,
            &ContactContent {
                profile_pic: Some(FieldUpdate::Set(pic.clone())),
                ..contact(&alice)
            },
        );
        let profile = graph.profile(&alice).unwrap();
        assert_eq!(profile.created_at, Some(42));
        assert_eq!(profile.self_assigned.profile_pic, Some(pic));

        graph.apply_contact(
            &alice,
            &ContactContent {
                profile_pic: Some(FieldUpdate::Clear),
                ..contact(&alice)
            },
        );
        assert_eq!(graph.profile(&alice).unwrap().self_assigned.profile_pic, None);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name(" alice smith "), "_alice_smith_");
        assert_eq!(sanitize_name("ok.name-1_x"), "ok.name-1_x");
        assert_eq!(sanitize_name("b\u{f6}b"), "b_b");
    }
}
