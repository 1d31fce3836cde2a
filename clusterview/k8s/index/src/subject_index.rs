use crate::NameSet;
use ahash::AHashMap as HashMap;
use clusterview_core::UserInfo;

/// Maps users and groups to the names they may discover.
///
/// Users and groups are kept in separate stores: the same string may name a user and an
/// unrelated group.
#[derive(Debug, Default)]
pub struct SubjectIndex {
    users: HashMap<String, SubjectRecord>,
    groups: HashMap<String, SubjectRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectRecord {
    pub subject: String,
    pub names: NameSet,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    User,
    Group,
}

/// Resolves the names a caller may see.
pub trait VisibleNames {
    fn visible_names(&self, user: &UserInfo) -> NameSet;
}

// === impl SubjectIndex ===

impl SubjectIndex {
    /// Replaces the subject's names wholesale, creating the record if needed.
    pub fn update(&mut self, kind: SubjectKind, subject: &str, names: NameSet) {
        match self.store_mut(kind).get_mut(subject) {
            Some(record) => record.names = names,
            None => {
                self.store_mut(kind).insert(
                    subject.to_string(),
                    SubjectRecord {
                        subject: subject.to_string(),
                        names,
                    },
                );
            }
        }
    }

    pub fn delete(&mut self, kind: SubjectKind, subject: &str) -> Option<SubjectRecord> {
        self.store_mut(kind).remove(subject)
    }

    /// Returns the union of the user's names and the names of each of its groups.
    pub fn lookup(&self, user: &UserInfo) -> NameSet {
        let mut names = self
            .users
            .get(&user.name)
            .map(|r| r.names.clone())
            .unwrap_or_default();
        for group in &user.groups {
            if let Some(record) = self.groups.get(group) {
                names.extend(record.names.iter().cloned());
            }
        }
        names
    }

    /// Tests a single name without materializing the caller's full set.
    pub fn contains(&self, user: &UserInfo, name: &str) -> bool {
        if self
            .users
            .get(&user.name)
            .is_some_and(|r| r.names.contains(name))
        {
            return true;
        }
        user.groups.iter().any(|g| {
            self.groups
                .get(g)
                .is_some_and(|r| r.names.contains(name))
        })
    }

    pub fn users_len(&self) -> usize {
        self.users.len()
    }

    pub fn groups_len(&self) -> usize {
        self.groups.len()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, kind: SubjectKind, subject: &str) -> Option<&SubjectRecord> {
        match kind {
            SubjectKind::User => self.users.get(subject),
            SubjectKind::Group => self.groups.get(subject),
        }
    }

    fn store_mut(&mut self, kind: SubjectKind) -> &mut HashMap<String, SubjectRecord> {
        match kind {
            SubjectKind::User => &mut self.users,
            SubjectKind::Group => &mut self.groups,
        }
    }
}

impl VisibleNames for SubjectIndex {
    fn visible_names(&self, user: &UserInfo) -> NameSet {
        self.lookup(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreeset;

    fn names(ns: &[&str]) -> NameSet {
        ns.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn update_then_lookup() {
        let mut index = SubjectIndex::default();
        index.update(SubjectKind::User, "alice", names(&["c1", "c2"]));
        assert_eq!(
            index.lookup(&UserInfo::new("alice", None::<&str>)),
            names(&["c1", "c2"])
        );
    }

    #[test]
    fn update_replaces_names() {
        let mut index = SubjectIndex::default();
        index.update(SubjectKind::User, "alice", names(&["c1", "c2"]));
        index.update(SubjectKind::User, "alice", names(&["c3"]));
        assert_eq!(
            index.lookup(&UserInfo::new("alice", None::<&str>)),
            btreeset!["c3".to_string()]
        );
    }

    #[test]
    fn lookup_unions_groups() {
        let mut index = SubjectIndex::default();
        index.update(SubjectKind::User, "alice", names(&["c1"]));
        index.update(SubjectKind::Group, "g1", names(&["c2"]));
        index.update(SubjectKind::Group, "g2", names(&["c1", "c3"]));

        let user = UserInfo::new("alice", ["g1", "g2", "g-missing"]);
        assert_eq!(index.lookup(&user), names(&["c1", "c2", "c3"]));
        assert!(index.contains(&user, "c3"));
        assert!(!index.contains(&user, "c4"));

        assert_eq!(
            index.lookup(&UserInfo::from_groups(["g1"])),
            names(&["c2"])
        );
    }

    #[test]
    fn users_and_groups_are_distinct() {
        let mut index = SubjectIndex::default();
        index.update(SubjectKind::Group, "alice", names(&["c1"]));
        assert!(index
            .lookup(&UserInfo::new("alice", None::<&str>))
            .is_empty());
        assert_eq!(
            index.lookup(&UserInfo::from_groups(["alice"])),
            names(&["c1"])
        );
    }

    #[test]
    fn delete_removes_record() {
        let mut index = SubjectIndex::default();
        index.update(SubjectKind::User, "alice", names(&["c1"]));
        assert!(index.delete(SubjectKind::User, "alice").is_some());
        assert!(index.delete(SubjectKind::User, "alice").is_none());
        assert_eq!(index.users_len(), 0);
        assert!(index
            .lookup(&UserInfo::new("alice", None::<&str>))
            .is_empty());
    }
}
