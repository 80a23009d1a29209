use crate::capability::Capability;
use crate::error::{ExecutorError, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::LazyLock;

static PACKAGE_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(@[A-Za-z0-9][A-Za-z0-9._-]*/)?[A-Za-z0-9][A-Za-z0-9._-]*([@=<>~^!]=?[A-Za-z0-9._*+^~-]+)?$")
        .map_err(|e| tracing::error!(error = %e, "invalid package name pattern"))
        .ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
    Pip,
    Cargo,
}

impl PackageManager {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Pnpm => "pnpm",
            Self::Pip => "pip",
            Self::Cargo => "cargo",
        }
    }

    fn install_prefix(self, dev: bool) -> &'static str {
        match (self, dev) {
            (Self::Npm, false) => "npm install",
            (Self::Npm, true) => "npm install --save-dev",
            (Self::Yarn, false) => "yarn add",
            (Self::Yarn, true) => "yarn add --dev",
            (Self::Pnpm, false) => "pnpm add",
            (Self::Pnpm, true) => "pnpm add --save-dev",
            (Self::Pip, _) => "pip install",
            (Self::Cargo, false) => "cargo add",
            (Self::Cargo, true) => "cargo add --dev",
        }
    }
}

impl FromStr for PackageManager {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "npm" => Ok(Self::Npm),
            "yarn" => Ok(Self::Yarn),
            "pnpm" => Ok(Self::Pnpm),
            "pip" | "pip3" => Ok(Self::Pip),
            "cargo" => Ok(Self::Cargo),
            other => Err(ExecutorError::InvalidArguments(format!(
                "unsupported package manager: {other}"
            ))),
        }
    }
}

/// A validated install request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageInstall {
    pub manager: PackageManager,
    pub packages: Vec<String>,
    pub dev: bool,
}

impl PackageInstall {
    /// Reads `manager` (default npm), `packages` (string or list) and `dev`.
    pub fn from_capability(capability: &Capability) -> Result<Self> {
        let manager = capability
            .optional_string("manager")?
            .as_deref()
            .unwrap_or("npm")
            .parse::<PackageManager>()?;
        let packages = match capability.parameters.get("packages") {
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.trim().to_string()),
                    other => Err(ExecutorError::InvalidArguments(format!(
                        "package names must be strings, got {other:?}"
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(ExecutorError::InvalidArguments(format!(
                    "packages must be a string or list, got {other:?}"
                )));
            }
            None => return Err(ExecutorError::InvalidArguments("missing key: packages".to_string())),
        };
        if packages.is_empty() {
            return Err(ExecutorError::InvalidArguments(
                "at least one package is required".to_string(),
            ));
        }
        for name in &packages {
            validate_package_name(name)?;
        }
        Ok(Self {
            manager,
            packages,
            dev: capability.optional_bool("dev")?,
        })
    }

    pub fn command(&self) -> String {
        format!(
            "{} {}",
            self.manager.install_prefix(self.dev),
            self.packages.join(" ")
        )
    }
}

fn validate_package_name(name: &str) -> Result<()> {
    let valid = PACKAGE_NAME
        .as_ref()
        .is_some_and(|re| re.is_match(name));
    if valid {
        Ok(())
    } else {
        Err(ExecutorError::InvalidArguments(format!(
            "invalid package name: {name:?}"
        )))
    }
}
