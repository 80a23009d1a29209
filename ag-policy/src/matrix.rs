use crate::mode::AutonomyMode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Operation types that always need a human, whatever the mode or flags say.
pub const DESTRUCTIVE_OPERATIONS: &[&str] = &[
    "file_deletion",
    "git_force_push",
    "git_reset_hard",
    "terminal_recursive_remove",
];

pub fn is_destructive(operation_type: &str) -> bool {
    DESTRUCTIVE_OPERATIONS.contains(&operation_type)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    Git,
    File,
    Terminal,
    Web,
    /// Catch-all for operation types without a known prefix.
    Approval,
}

impl OperationCategory {
    pub const ALL: [OperationCategory; 5] = [
        Self::Git,
        Self::File,
        Self::Terminal,
        Self::Web,
        Self::Approval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::File => "file",
            Self::Terminal => "terminal",
            Self::Web => "web",
            Self::Approval => "approval",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// `git_push` belongs to git, `file_edit` to file; anything else lands in approval.
    pub fn of(operation_type: &str) -> Self {
        Self::split(operation_type).0
    }

    fn split(operation_type: &str) -> (Self, &str) {
        for category in [Self::Git, Self::File, Self::Terminal, Self::Web] {
            if let Some(rest) = operation_type
                .strip_prefix(category.as_str())
                .and_then(|rest| rest.strip_prefix('_'))
            {
                if !rest.is_empty() {
                    return (category, rest);
                }
            }
        }
        (Self::Approval, operation_type)
    }

    fn default_flags(self) -> &'static [&'static str] {
        match self {
            Self::Git => &["commit", "push", "pull", "branch", "merge"],
            Self::File => &["creation", "edit", "copy", "move"],
            Self::Terminal => &["command"],
            Self::Web => &["search", "fetch"],
            Self::Approval => &["package_installation"],
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits an operation type into its category and the flag name inside it:
/// `file_creation` becomes `(File, "creation")`.
pub fn flag_for(operation_type: &str) -> (OperationCategory, &str) {
    OperationCategory::split(operation_type)
}

pub type CategoryFlags = BTreeMap<String, bool>;

/// Auto-execute flags per category for one autonomy mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyMatrix {
    categories: BTreeMap<OperationCategory, CategoryFlags>,
}

impl PolicyMatrix {
    /// Collaborative turns every flag off, autonomous turns every flag on.
    pub fn for_mode(mode: AutonomyMode) -> Self {
        let allowed = mode == AutonomyMode::Autonomous;
        let categories = OperationCategory::ALL
            .into_iter()
            .map(|category| {
                let flags = category
                    .default_flags()
                    .iter()
                    .map(|flag| (flag.to_string(), allowed))
                    .collect();
                (category, flags)
            })
            .collect();
        Self { categories }
    }

    /// `None` when the operation has no flag in its category.
    pub fn auto_execute(&self, operation_type: &str) -> Option<bool> {
        let (category, flag) = flag_for(operation_type);
        self.categories
            .get(&category)
            .and_then(|flags| flags.get(flag))
            .copied()
    }

    pub fn set(&mut self, operation_type: &str, allowed: bool) {
        let (category, flag) = flag_for(operation_type);
        self.set_flag(category, flag, allowed);
    }

    pub fn set_flag(&mut self, category: OperationCategory, flag: &str, allowed: bool) {
        self.categories
            .entry(category)
            .or_default()
            .insert(flag.to_string(), allowed);
    }

    pub fn category(&self, category: OperationCategory) -> CategoryFlags {
        self.categories.get(&category).cloned().unwrap_or_default()
    }

    /// Flat `policy.<category>.<flag>` entries for the settings store.
    pub fn to_entries(&self) -> BTreeMap<String, String> {
        let mut entries = BTreeMap::new();
        for (category, flags) in &self.categories {
            for (flag, allowed) in flags {
                entries.insert(setting_key(*category, flag), allowed.to_string());
            }
        }
        entries
    }

    /// Applies `policy.<category>.<flag>` entries on top of the matrix. Returns the keys that
    /// could not be understood.
    pub fn apply_entries(&mut self, entries: &BTreeMap<String, String>) -> Vec<String> {
        let mut rejected = Vec::new();
        for (key, value) in entries {
            let Some(rest) = key.strip_prefix(SETTING_PREFIX) else {
                continue;
            };
            if rest == "mode" {
                continue;
            }
            let parsed = rest.split_once('.').and_then(|(category, flag)| {
                let category = OperationCategory::parse(category)?;
                let allowed = value.trim().parse::<bool>().ok()?;
                (!flag.is_empty()).then(|| (category, flag, allowed))
            });
            match parsed {
                Some((category, flag, allowed)) => self.set_flag(category, flag, allowed),
                None => rejected.push(key.clone()),
            }
        }
        rejected
    }
}

pub(crate) const SETTING_PREFIX: &str = "policy.";
pub(crate) const MODE_KEY: &str = "policy.mode";

pub(crate) fn setting_key(category: OperationCategory, flag: &str) -> String {
    format!("{SETTING_PREFIX}{category}.{flag}")
}
