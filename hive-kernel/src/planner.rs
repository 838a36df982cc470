/**
 * PLANNER - Composition de la liste de tâches à partir du work item
 *
 * RÔLE : Le leader transforme la description du work item en `TaskSpec`s avant
 * l'unique `task_publish` initial.
 *
 * FONCTIONNEMENT :
 * - une stratégie = suite de phases, chaque phase dépend de la précédente
 * - une phase « implémentation » par stratégie ; si le corps du work item contient
 *   une liste (puces ou numéros), elle est éclatée en une tâche par élément
 * - ids séquentiels `task-1..n` dans l'ordre de publication
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::bus::WorkItem;
use crate::lifecycle::TaskStatus;
use crate::message::TaskSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    FeatureFirst,
    TestDriven,
    Waterfall,
    /// une seule tâche généraliste
    Single,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FeatureFirst => "feature_first",
            Self::TestDriven => "test_driven",
            Self::Waterfall => "waterfall",
            Self::Single => "single",
        }
    }

    fn phases(self) -> &'static [Phase] {
        match self {
            Self::FeatureFirst => FEATURE_FIRST,
            Self::TestDriven => TEST_DRIVEN,
            Self::Waterfall => WATERFALL,
            Self::Single => SINGLE,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "feature_first" => Ok(Self::FeatureFirst),
            "test_driven" | "tdd" => Ok(Self::TestDriven),
            "waterfall" => Ok(Self::Waterfall),
            "single" => Ok(Self::Single),
            other => Err(format!("unknown planning strategy '{other}'")),
        }
    }
}

struct Phase {
    title: &'static str,
    action: &'static str,
    skills: &'static [&'static str],
    priority: u8,
    hours: f32,
    implementation: bool,
}

const FEATURE_FIRST: &[Phase] = &[
    Phase { title: "Backend", action: "Implement backend logic for", skills: &["backend", "database", "api"], priority: 10, hours: 12.0, implementation: true },
    Phase { title: "Frontend", action: "Implement UI components for", skills: &["frontend", "ui", "ux"], priority: 9, hours: 10.0, implementation: false },
    Phase { title: "Integration", action: "Integrate and test end-to-end", skills: &["testing", "integration"], priority: 8, hours: 6.0, implementation: false },
];

const TEST_DRIVEN: &[Phase] = &[
    Phase { title: "Write tests", action: "Define failing test cases for", skills: &["testing", "tdd"], priority: 10, hours: 8.0, implementation: false },
    Phase { title: "Implement", action: "Make the tests pass for", skills: &["backend", "frontend", "tdd"], priority: 9, hours: 12.0, implementation: true },
    Phase { title: "Refactor", action: "Refactor with tests green for", skills: &["refactoring", "clean_code"], priority: 7, hours: 6.0, implementation: false },
];

const WATERFALL: &[Phase] = &[
    Phase { title: "Requirements", action: "Gather and document requirements for", skills: &["requirements", "documentation"], priority: 10, hours: 4.0, implementation: false },
    Phase { title: "Design", action: "Create the technical design for", skills: &["architecture", "design"], priority: 9, hours: 6.0, implementation: false },
    Phase { title: "Implement", action: "Implement", skills: &["backend", "frontend", "database"], priority: 8, hours: 16.0, implementation: true },
    Phase { title: "Test", action: "Write comprehensive tests for", skills: &["testing", "qa"], priority: 7, hours: 8.0, implementation: false },
    Phase { title: "Document", action: "Write user and developer documentation for", skills: &["documentation"], priority: 6, hours: 4.0, implementation: false },
];

const SINGLE: &[Phase] = &[
    Phase { title: "Deliver", action: "Deliver", skills: &[], priority: 5, hours: 8.0, implementation: true },
];

/// Éléments de liste (`-`, `*`, `+`, `1.`, `1)`) du corps du work item, cases à cocher comprises.
pub fn list_items(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line
                .strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .or_else(|| line.strip_prefix("+ "))
                .or_else(|| {
                    let digits = line.find(|c: char| !c.is_ascii_digit())?;
                    if digits == 0 {
                        return None;
                    }
                    line[digits..]
                        .strip_prefix(". ")
                        .or_else(|| line[digits..].strip_prefix(") "))
                })?;
            let rest = rest
                .strip_prefix("[ ] ")
                .or_else(|| rest.strip_prefix("[x] "))
                .unwrap_or(rest)
                .trim();
            (!rest.is_empty()).then(|| rest.to_string())
        })
        .collect()
}

/// Liste de tâches initiale pour un work item.
pub fn compose(item: &WorkItem, strategy: Strategy) -> Vec<TaskSpec> {
    let subject = item.title.trim();
    let items = list_items(&item.body);
    let mut specs: Vec<TaskSpec> = Vec::new();
    let mut previous: BTreeSet<String> = BTreeSet::new();

    for phase in strategy.phases() {
        let units: Vec<(String, String)> = if phase.implementation && !items.is_empty() {
            items
                .iter()
                .map(|it| (format!("{}: {}", phase.title, it), format!("{} {}: {}", phase.action, subject, it)))
                .collect()
        } else {
            let mut description = format!("{} {}", phase.action, subject);
            if phase.implementation && !item.body.trim().is_empty() {
                description.push_str("\n\n");
                description.push_str(item.body.trim());
            }
            vec![(format!("{}: {}", phase.title, subject), description)]
        };

        let mut current = BTreeSet::new();
        for (title, description) in units {
            let id = format!("task-{}", specs.len() + 1);
            current.insert(id.clone());
            specs.push(TaskSpec {
                id,
                title,
                description,
                required_skills: phase.skills.iter().map(|s| s.to_string()).collect(),
                priority: phase.priority,
                estimated_hours: phase.hours,
                dependencies: previous.clone(),
                status: TaskStatus::Pending,
            });
        }
        previous = current;
    }
    specs
}
