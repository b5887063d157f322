//! Filesystem allow-listing with Landlock.
//!
//! Rules use the `mode:path` form where mode is any combination of
//! `r` (read), `w` (write), `x` (execute) and `c` (create/remove entries).
//! Restrictions apply to the calling process and every descendant.

use crate::config::types::{Result, SandboxError};
use landlock::{
    Access, AccessFs, BitFlags, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreatedAttr,
    RulesetStatus, ABI,
};
use std::path::{Path, PathBuf};

const LANDLOCK_ABI: ABI = ABI::V2;

/// OS paths unveiled when defaults are requested. Missing ones are skipped.
pub const DEFAULT_RULES: &[&str] = &[
    "rx:/bin",
    "rx:/sbin",
    "rx:/usr/bin",
    "rx:/usr/sbin",
    "rx:/usr/local/bin",
    "rx:/lib",
    "rx:/lib64",
    "rx:/usr/lib",
    "rx:/usr/lib64",
    "rx:/usr/libexec",
    "r:/usr/share",
    "r:/etc/ld.so.cache",
    "r:/etc/ld.so.conf",
    "r:/etc/ld.so.conf.d",
    "r:/etc/passwd",
    "r:/etc/group",
    "r:/etc/nsswitch.conf",
    "r:/etc/hosts",
    "r:/etc/resolv.conf",
    "r:/etc/localtime",
    "r:/etc/ssl",
    "r:/proc",
    "rw:/dev/null",
    "r:/dev/zero",
    "r:/dev/random",
    "r:/dev/urandom",
];

/// One parsed `mode:path` rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnveilRule {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub create: bool,
    pub path: PathBuf,
}

impl UnveilRule {
    pub fn parse(rule: &str) -> Result<Self> {
        let (mode, path) = rule
            .split_once(':')
            .ok_or_else(|| SandboxError::Unveil(format!("rule {:?} is not mode:path", rule)))?;

        if mode.is_empty() || path.is_empty() {
            return Err(SandboxError::Unveil(format!(
                "rule {:?} needs both a mode and a path",
                rule
            )));
        }

        let mut parsed = UnveilRule {
            read: false,
            write: false,
            execute: false,
            create: false,
            path: PathBuf::from(path),
        };
        for c in mode.chars() {
            match c {
                'r' => parsed.read = true,
                'w' => parsed.write = true,
                'x' => parsed.execute = true,
                'c' => parsed.create = true,
                other => {
                    return Err(SandboxError::Unveil(format!(
                        "unknown mode {:?} in rule {:?}",
                        other, rule
                    )))
                }
            }
        }
        Ok(parsed)
    }

    /// Landlock rights granted by this rule.
    pub fn access(&self) -> BitFlags<AccessFs> {
        let mut access = BitFlags::<AccessFs>::empty();
        if self.read {
            access |= AccessFs::ReadFile | AccessFs::ReadDir;
        }
        if self.write {
            access |= AccessFs::WriteFile;
        }
        if self.execute {
            access |= AccessFs::Execute;
        }
        if self.create {
            access |= AccessFs::MakeReg
                | AccessFs::MakeDir
                | AccessFs::MakeSym
                | AccessFs::MakeFifo
                | AccessFs::MakeSock
                | AccessFs::RemoveFile
                | AccessFs::RemoveDir;
        }
        access
    }
}

/// Parse explicit rules, appending the defaults when requested.
///
/// The returned flag marks rules whose path may be absent.
pub fn collect_rules(defaults: bool, rules: &[String]) -> Result<Vec<(UnveilRule, bool)>> {
    let mut parsed = Vec::with_capacity(rules.len() + DEFAULT_RULES.len());
    if defaults {
        for rule in DEFAULT_RULES {
            parsed.push((UnveilRule::parse(rule)?, true));
        }
    }
    for rule in rules {
        parsed.push((UnveilRule::parse(rule)?, false));
    }
    Ok(parsed)
}

/// Restrict this process and its descendants to the given rules.
pub fn lockdown(defaults: bool, rules: &[String]) -> Result<()> {
    let rules = collect_rules(defaults, rules)?;
    let file_rights = AccessFs::from_file(LANDLOCK_ABI);

    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(LANDLOCK_ABI))
        .map_err(|e| SandboxError::Unveil(format!("landlock ruleset: {}", e)))?
        .create()
        .map_err(|e| SandboxError::Unveil(format!("landlock create: {}", e)))?;

    for (rule, optional) in &rules {
        if !rule.path.exists() {
            if *optional {
                continue;
            }
            return Err(SandboxError::Unveil(format!(
                "path {} does not exist",
                rule.path.display()
            )));
        }

        let mut access = rule.access() & AccessFs::from_all(LANDLOCK_ABI);
        if !is_dir(&rule.path) {
            access &= file_rights;
        }
        if access.is_empty() {
            continue;
        }

        let fd = PathFd::new(&rule.path).map_err(|e| {
            SandboxError::Unveil(format!("open {}: {}", rule.path.display(), e))
        })?;
        ruleset = ruleset
            .add_rule(PathBeneath::new(fd, access))
            .map_err(|e| {
                SandboxError::Unveil(format!("rule for {}: {}", rule.path.display(), e))
            })?;
    }

    let status = ruleset
        .restrict_self()
        .map_err(|e| SandboxError::Unveil(format!("landlock restrict: {}", e)))?;
    if matches!(status.ruleset, RulesetStatus::NotEnforced) {
        return Err(SandboxError::Unveil(
            "landlock is not supported by the running kernel".to_string(),
        ));
    }
    Ok(())
}

fn is_dir(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}
