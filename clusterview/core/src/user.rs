/// An authenticated caller.
///
/// The user name and group names live in separate namespaces: a user and a group may share a
/// name without being related.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct UserInfo {
    pub name: String,
    pub groups: Vec<String>,
}

impl UserInfo {
    pub fn new(
        name: impl ToString,
        groups: impl IntoIterator<Item = impl ToString>,
    ) -> Self {
        Self {
            name: name.to_string(),
            groups: groups.into_iter().map(|g| g.to_string()).collect(),
        }
    }

    /// A caller identified only by its group memberships.
    pub fn from_groups(groups: impl IntoIterator<Item = impl ToString>) -> Self {
        Self::new("", groups)
    }
}
