//! Launch scenarios (test/reset directives).
//!
//! A scenario is passed on the command line (`--scenario populated`) and
//! forces the settings store and the structured store through their
//! destructive reset-and-seed path instead of normal migration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Launch argument that carries a scenario name.
pub const SCENARIO_ARG: &str = "--scenario";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// Wipe everything, then seed only what a fresh install has.
    Empty,
    /// Wipe everything, then seed deterministic demo content.
    Populated,
}

impl Scenario {
    pub const ALL: [Scenario; 2] = [Scenario::Empty, Scenario::Populated];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Empty => "empty",
            Scenario::Populated => "populated",
        }
    }

    /// Whether the seed for this scenario includes demo content.
    pub fn has_demo_content(&self) -> bool {
        matches!(self, Scenario::Populated)
    }

    /// Find a scenario in process launch arguments.
    ///
    /// Accepts both `--scenario name` and `--scenario=name`. The last
    /// occurrence wins. Unknown names are logged and ignored.
    pub fn from_args<I, S>(args: I) -> Option<Scenario>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut found = None;
        let mut expect_value = false;

        for arg in args {
            let arg = arg.as_ref();
            let value = if expect_value {
                expect_value = false;
                Some(arg)
            } else if arg == SCENARIO_ARG {
                expect_value = true;
                None
            } else {
                arg.strip_prefix(SCENARIO_ARG).and_then(|rest| rest.strip_prefix('='))
            };

            if let Some(value) = value {
                match value.parse::<Scenario>() {
                    Ok(scenario) => found = Some(scenario),
                    Err(e) => log::warn!("Ignoring launch scenario: {}", e),
                }
            }
        }

        found
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseScenarioError(pub String);

impl fmt::Display for ParseScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown scenario '{}' (expected one of: empty, populated)", self.0)
    }
}

impl std::error::Error for ParseScenarioError {}

impl FromStr for Scenario {
    type Err = ParseScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "empty" => Ok(Scenario::Empty),
            "populated" => Ok(Scenario::Populated),
            _ => Err(ParseScenarioError(s.to_string())),
        }
    }
}
