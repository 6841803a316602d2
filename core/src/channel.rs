//! Channel state and membership tracking

use crate::entity::EntityId;
use crate::pool::Reclaim;
use crate::utils::string::casefold;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;

/// Per-member channel privileges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberModes {
    pub op: bool,
    pub voice: bool,
}

/// One user's seat in one channel
#[derive(Debug, Clone, Default)]
pub struct Membership {
    pub user: EntityId,
    pub modes: MemberModes,
}

impl Reclaim for Membership {
    fn reset(&mut self) {
        *self = Membership::default();
    }
}

/// Channel topic with attribution
#[derive(Debug, Clone)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: DateTime<Utc>,
}

/// A named broadcast group
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub modes: HashSet<char>,
    pub topic: Option<Topic>,
    pub members: Vec<Membership>,
    pub bans: Vec<String>,
    /// Server links currently mid-burst for this channel
    pub bursting: HashSet<EntityId>,
}

impl Channel {
    pub fn new(name: String) -> Self {
        Self {
            name,
            created_at: Utc::now(),
            modes: HashSet::new(),
            topic: None,
            members: Vec::new(),
            bans: Vec::new(),
            bursting: HashSet::new(),
        }
    }

    pub fn member(&self, user: EntityId) -> Option<&Membership> {
        self.members.iter().find(|m| m.user == user)
    }

    pub fn is_member(&self, user: EntityId) -> bool {
        self.member(user).is_some()
    }

    pub fn is_op(&self, user: EntityId) -> bool {
        self.member(user).map_or(false, |m| m.modes.op)
    }

    /// Channels with mode +P survive emptying out
    pub fn is_permanent(&self) -> bool {
        self.modes.contains(&'P')
    }
}

/// All channels known to this server, keyed by case-folded name
#[derive(Debug, Default)]
pub struct ChannelMap {
    channels: DashMap<String, Channel>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Add `member` to `name`, creating the channel on first join. Returns
    /// true when this join created the channel (the creator gets ops).
    pub fn join(&self, name: &str, mut member: Membership) -> bool {
        let key = casefold(name);
        let mut created = false;
        let mut chan = self.channels.entry(key).or_insert_with(|| {
            created = true;
            Channel::new(name.to_string())
        });
        if created {
            member.modes.op = true;
        }
        if !chan.is_member(member.user) {
            chan.members.push(member);
        }
        created
    }

    /// Create an empty channel if it does not exist yet.
    pub fn ensure(&self, name: &str) {
        self.channels
            .entry(casefold(name))
            .or_insert_with(|| Channel::new(name.to_string()));
    }

    /// Remove `user` from `name`; returns the released seat, if any.
    pub fn part(&self, name: &str, user: EntityId) -> Option<Membership> {
        let key = casefold(name);
        let mut chan = self.channels.get_mut(&key)?;
        let idx = chan.members.iter().position(|m| m.user == user)?;
        Some(chan.members.remove(idx))
    }

    pub fn get(&self, name: &str) -> Option<Channel> {
        self.channels.get(&casefold(name)).map(|c| c.value().clone())
    }

    pub fn with_channel_mut<R>(&self, name: &str, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        self.channels.get_mut(&casefold(name)).map(|mut c| f(&mut c))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(&casefold(name))
    }

    pub fn member_ids(&self, name: &str) -> Vec<EntityId> {
        self.channels
            .get(&casefold(name))
            .map(|c| c.members.iter().map(|m| m.user).collect())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Destroy channels that have emptied out, keeping +P ones. Returns
    /// the names destroyed.
    pub fn sweep(&self) -> Vec<String> {
        let doomed: Vec<String> = self
            .channels
            .iter()
            .filter(|c| c.members.is_empty() && !c.is_permanent())
            .map(|c| c.key().clone())
            .collect();
        let mut names = Vec::with_capacity(doomed.len());
        for key in doomed {
            if let Some((_, chan)) = self.channels.remove(&key) {
                names.push(chan.name);
            }
        }
        names
    }

    pub fn begin_burst(&self, name: &str, link: EntityId) {
        if let Some(mut chan) = self.channels.get_mut(&casefold(name)) {
            chan.bursting.insert(link);
        }
    }

    pub fn end_burst(&self, name: &str, link: EntityId) {
        if let Some(mut chan) = self.channels.get_mut(&casefold(name)) {
            chan.bursting.remove(&link);
        }
    }

    pub fn is_bursting(&self, name: &str, link: EntityId) -> bool {
        self.channels
            .get(&casefold(name))
            .map_or(false, |c| c.bursting.contains(&link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seat(id: EntityId) -> Membership {
        Membership { user: id, modes: MemberModes::default() }
    }

    #[test]
    fn test_creator_gets_ops() {
        let map = ChannelMap::new();
        let alice = EntityId::new();
        let bob = EntityId::new();
        assert!(map.join("#ops", seat(alice)));
        assert!(!map.join("#ops", seat(bob)));
        let chan = map.get("#ops").unwrap();
        assert!(chan.is_op(alice));
        assert!(!chan.is_op(bob));
    }

    #[test]
    fn test_casefolded_lookup() {
        let map = ChannelMap::new();
        map.join("#Ops[1]", seat(EntityId::new()));
        assert!(map.contains("#ops{1}"));
        assert_eq!(map.get("#OPS[1]").unwrap().name, "#Ops[1]");
    }

    #[test]
    fn test_sweep_destroys_empty_non_permanent() {
        let map = ChannelMap::new();
        let alice = EntityId::new();
        map.join("#fleeting", seat(alice));
        map.join("#forever", seat(alice));
        map.with_channel_mut("#forever", |c| {
            c.modes.insert('P');
        });
        map.part("#fleeting", alice);
        map.part("#forever", alice);

        let destroyed = map.sweep();
        assert_eq!(destroyed, vec!["#fleeting".to_string()]);
        assert!(map.contains("#forever"));
    }

    #[test]
    fn test_nonempty_channel_survives_sweep() {
        let map = ChannelMap::new();
        map.join("#ops", seat(EntityId::new()));
        assert!(map.sweep().is_empty());
        assert!(map.contains("#ops"));
    }

    #[test]
    fn test_burst_tracking() {
        let map = ChannelMap::new();
        let link = EntityId::new();
        map.join("#ops", seat(EntityId::new()));
        assert!(!map.is_bursting("#ops", link));
        map.begin_burst("#ops", link);
        assert!(map.is_bursting("#ops", link));
        map.end_burst("#ops", link);
        assert!(!map.is_bursting("#ops", link));
    }
}
