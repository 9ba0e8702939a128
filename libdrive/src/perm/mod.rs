//! Path-permission resolver over a hierarchical subject/path matrix
//! with accept/reject precedence: deeper records override shallower
//! ones, specific subjects override broader ones, and reject dominates
//! accept at equal specificity.

use bitflags::bitflags;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::path;
use crate::tree::PathTree;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Permission: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl Permission {
    pub fn full() -> Self {
        Self::READ | Self::WRITE
    }

    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(d)?;
        Permission::from_bits(bits)
            .ok_or_else(|| D::Error::custom(format!("invalid permission bits: {bits}")))
    }
}

/// Identity dimension of a permission record. Wire forms: `"ANY"`,
/// `"u:<username>"`, `"g:<groupname>"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Subject {
    Any,
    User(String),
    Group(String),
}

impl Subject {
    pub fn parse(s: &str) -> Option<Self> {
        if s == "ANY" {
            return Some(Self::Any);
        }
        if let Some(u) = s.strip_prefix("u:") {
            return Some(Self::User(u.to_string()));
        }
        if let Some(g) = s.strip_prefix("g:") {
            return Some(Self::Group(g.to_string()));
        }
        None
    }

    /// Lower is more specific: a user record beats a group record
    /// beats an anonymous one.
    fn rank(&self) -> u8 {
        match self {
            Self::User(_) => 0,
            Self::Group(_) => 1,
            Self::Any => 2,
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => f.write_str("ANY"),
            Self::User(u) => write!(f, "u:{u}"),
            Self::Group(g) => write!(f, "g:{g}"),
        }
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Subject::parse(&s).ok_or_else(|| D::Error::custom(format!("invalid subject: {s}")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Reject,
    Accept,
}

impl Policy {
    /// Sort order at equal depth/specificity: reject first, so it
    /// claims the bits before the accept is reduced.
    fn rank(&self) -> u8 {
        match self {
            Self::Reject => 0,
            Self::Accept => 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathPermission {
    pub path: String,
    pub subject: Subject,
    pub permission: Permission,
    pub policy: Policy,
}

impl PathPermission {
    pub fn new(p: &str, subject: Subject, permission: Permission, policy: Policy) -> Self {
        Self {
            path: path::clean(p),
            subject,
            permission,
            policy,
        }
    }
}

/// The authenticated caller: a user name (if any) plus group
/// memberships.
#[derive(Clone, Debug, Default)]
pub struct Session {
    pub user: Option<String>,
    pub groups: Vec<String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self {
            user: Some(name.into()),
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    fn subjects(&self) -> Vec<Subject> {
        let mut subjects = vec![Subject::Any];
        if let Some(u) = &self.user {
            subjects.push(Subject::User(u.clone()));
        }
        for g in &self.groups {
            subjects.push(Subject::Group(g.clone()));
        }
        subjects
    }
}

pub struct PermissionResolver {
    index: RwLock<HashMap<Subject, PathTree<PathPermission>>>,
    admin_group: String,
}

impl PermissionResolver {
    pub fn new(records: Vec<PathPermission>, admin_group: impl Into<String>) -> Self {
        let resolver = Self {
            index: RwLock::new(HashMap::new()),
            admin_group: admin_group.into(),
        };
        resolver.reload(records);
        resolver
    }

    /// Rebuild the whole subject index and swap it in atomically.
    pub fn reload(&self, records: Vec<PathPermission>) {
        let mut index: HashMap<Subject, PathTree<PathPermission>> = HashMap::new();
        for rec in records {
            let subject = rec.subject.clone();
            let path = rec.path.clone();
            index.entry(subject).or_default().set(&path, rec);
        }
        *self.index.write().unwrap() = index;
    }

    pub fn is_admin(&self, session: &Session) -> bool {
        session.groups.iter().any(|g| g == &self.admin_group)
    }

    /// Accessible bits for `(session, path)`.
    pub fn resolve_path(&self, session: &Session, p: &str) -> Permission {
        if self.is_admin(session) {
            return Permission::full();
        }
        let mut collected = Vec::new();
        {
            let index = self.index.read().unwrap();
            for subject in session.subjects() {
                if let Some(tree) = index.get(&subject) {
                    tree.visit_along(p, |node_path, rec| {
                        collected.push((path::depth(node_path), rec.clone()));
                    });
                }
            }
        }
        Self::reduce(collected)
    }

    /// Bits granted anywhere strictly below `p`; used to keep a
    /// directory visible when something under it is accessible.
    pub fn resolve_descendant(&self, session: &Session, p: &str) -> Permission {
        if self.is_admin(session) {
            return Permission::full();
        }
        let mut collected = Vec::new();
        {
            let index = self.index.read().unwrap();
            for subject in session.subjects() {
                if let Some(tree) = index.get(&subject) {
                    tree.visit(p, |node_path, rec| {
                        if node_path != p {
                            collected.push((path::depth(node_path), rec.clone()));
                        }
                    });
                }
            }
        }
        Self::reduce(collected)
    }

    fn reduce(mut collected: Vec<(usize, PathPermission)>) -> Permission {
        collected.sort_by(|(da, a), (db, b)| {
            db.cmp(da)
                .then(a.subject.rank().cmp(&b.subject.rank()))
                .then(a.policy.rank().cmp(&b.policy.rank()))
        });
        let mut accepted = Permission::empty();
        let mut rejected = Permission::empty();
        for (_, rec) in collected {
            match rec.policy {
                Policy::Accept => accepted |= rec.permission & !rejected,
                Policy::Reject => rejected |= rec.permission & !accepted,
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any(p: &str, perm: Permission, policy: Policy) -> PathPermission {
        PathPermission::new(p, Subject::Any, perm, policy)
    }

    #[test]
    fn accept_reject_precedence() {
        let resolver = PermissionResolver::new(
            vec![
                any("", Permission::READ, Policy::Accept),
                any("secret", Permission::READ, Policy::Reject),
                any("secret/public", Permission::READ, Policy::Accept),
            ],
            "admin",
        );
        let s = Session::anonymous();
        assert_eq!(resolver.resolve_path(&s, ""), Permission::READ);
        assert_eq!(resolver.resolve_path(&s, "secret"), Permission::empty());
        assert_eq!(resolver.resolve_path(&s, "secret/public"), Permission::READ);
        assert_eq!(resolver.resolve_path(&s, "secret/other"), Permission::empty());
    }

    #[test]
    fn reload_replaces_the_matrix() {
        let resolver =
            PermissionResolver::new(vec![any("old", Permission::READ, Policy::Accept)], "admin");
        let s = Session::anonymous();
        assert_eq!(resolver.resolve_path(&s, "old"), Permission::READ);
        resolver.reload(vec![any("new", Permission::WRITE, Policy::Accept)]);
        assert_eq!(resolver.resolve_path(&s, "old"), Permission::empty());
        assert_eq!(resolver.resolve_path(&s, "new"), Permission::WRITE);
    }

    #[test]
    fn specific_subject_overrides_any() {
        let resolver = PermissionResolver::new(
            vec![
                any("docs", Permission::READ, Policy::Accept),
                PathPermission::new(
                    "docs",
                    Subject::User("bob".into()),
                    Permission::READ,
                    Policy::Reject,
                ),
                PathPermission::new(
                    "docs",
                    Subject::Group("staff".into()),
                    Permission::WRITE,
                    Policy::Accept,
                ),
            ],
            "admin",
        );
        assert_eq!(
            resolver.resolve_path(&Session::anonymous(), "docs"),
            Permission::READ
        );
        assert_eq!(
            resolver.resolve_path(&Session::user("bob"), "docs"),
            Permission::empty()
        );
        assert_eq!(
            resolver.resolve_path(
                &Session::user("eve").with_groups(vec!["staff".into()]),
                "docs"
            ),
            Permission::full()
        );
    }

    #[test]
    fn user_reject_beats_group_accept_at_same_depth() {
        let resolver = PermissionResolver::new(
            vec![
                PathPermission::new(
                    "p",
                    Subject::Group("staff".into()),
                    Permission::full(),
                    Policy::Accept,
                ),
                PathPermission::new(
                    "p",
                    Subject::User("bob".into()),
                    Permission::WRITE,
                    Policy::Reject,
                ),
            ],
            "admin",
        );
        let bob = Session::user("bob").with_groups(vec!["staff".into()]);
        assert_eq!(resolver.resolve_path(&bob, "p"), Permission::READ);
    }

    #[test]
    fn admin_bypasses() {
        let resolver = PermissionResolver::new(vec![], "admin");
        let root = Session::user("root").with_groups(vec!["admin".into()]);
        assert_eq!(resolver.resolve_path(&root, "anything"), Permission::full());
    }

    #[test]
    fn descendant_grants_visibility() {
        let resolver = PermissionResolver::new(
            vec![
                any("top", Permission::READ, Policy::Reject),
                any("top/deep/open", Permission::READ, Policy::Accept),
            ],
            "admin",
        );
        let s = Session::anonymous();
        assert_eq!(resolver.resolve_path(&s, "top"), Permission::empty());
        assert_eq!(resolver.resolve_descendant(&s, "top"), Permission::READ);
        assert_eq!(
            resolver.resolve_descendant(&s, "elsewhere"),
            Permission::empty()
        );
    }

    #[test]
    fn reject_never_widens() {
        let base = vec![any("d", Permission::full(), Policy::Accept)];
        let resolver = PermissionResolver::new(base.clone(), "admin");
        let before = resolver.resolve_path(&Session::anonymous(), "d/leaf");
        let mut with_reject = base;
        with_reject.push(any("d/leaf", Permission::WRITE, Policy::Reject));
        resolver.reload(with_reject);
        let after = resolver.resolve_path(&Session::anonymous(), "d/leaf");
        assert!(before.contains(after));
        assert_eq!(after, Permission::READ);
    }

    #[test]
    fn wire_shape() {
        let rec = any("a", Permission::READ, Policy::Reject);
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["subject"], "ANY");
        assert_eq!(v["permission"], 1);
        assert_eq!(v["policy"], "reject");
        let back: PathPermission = serde_json::from_value(v).unwrap();
        assert_eq!(back.subject, Subject::Any);
    }
}
