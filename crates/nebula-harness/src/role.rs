//! Node roles of a Nebula cluster.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three node kinds in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Metadata node.
    Metad,

    /// Storage node.
    Storaged,

    /// Query node.
    Graphd,
}

impl Role {
    /// Roles in spawn order. Metadata nodes come first since every other
    /// node points at them.
    pub const ALL: [Role; 3] = [Role::Metad, Role::Storaged, Role::Graphd];

    /// Short role name as used in binary and file names.
    pub fn name(self) -> &'static str {
        match self {
            Role::Metad => "metad",
            Role::Storaged => "storaged",
            Role::Graphd => "graphd",
        }
    }

    /// `nebula-{role}`.
    pub fn binary_name(self) -> String {
        format!("nebula-{}", self.name())
    }

    /// Config file name inside the working layout.
    pub fn conf_name(self) -> String {
        format!("nebula-{}.conf", self.name())
    }

    /// Config template name inside the source tree.
    pub fn default_conf_name(self) -> String {
        format!("nebula-{}.conf.default", self.name())
    }

    /// Query nodes are stateless.
    pub fn has_data_path(self) -> bool {
        self != Role::Graphd
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
