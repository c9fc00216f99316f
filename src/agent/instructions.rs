//! Deterministic per-phase instructions.

use std::fmt::Write as _;

use porter_common::{Project, UnitKind, UnitPhase, WorkUnit};

/// What went wrong on the previous attempt of the same unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    Gate { gate_name: String, excerpt: String },
    Agent { phase: UnitPhase, message: String },
}

pub struct InstructionContext<'a> {
    pub project: &'a Project,
    pub target: &'a str,
    /// Directory the migrated code is written to, relative to the workdir
    pub target_dir: &'a str,
    pub unit: &'a WorkUnit,
    pub phase: UnitPhase,
    pub attempt: u32,
    pub feedback: Option<&'a Feedback>,
}

fn objective(phase: UnitPhase) -> &'static str {
    match phase {
        UnitPhase::Contracting => {
            "Write down the observable behaviour of the unit as an I/O contract: inputs, outputs, errors."
        }
        UnitPhase::Analyzing => "Study the source and record how it meets the contract.",
        UnitPhase::Migrating => "Write the target-language implementation of the unit.",
        UnitPhase::Reviewing => {
            "Review the migrated code against the contract and fix anything that does not build or diverges."
        }
        UnitPhase::GateCheck => "Run the quality gates.",
    }
}

pub fn build_instructions(ctx: &InstructionContext<'_>) -> String {
    let project = ctx.project;
    let unit = ctx.unit;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "# {} {}: migrate {} from {} to {}",
        unit.kind, unit.id, project.name, project.source.language, ctx.target
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "Phase: {} (attempt {})", ctx.phase, ctx.attempt);
    let _ = writeln!(out, "Objective: {}", objective(ctx.phase));
    let _ = writeln!(out, "Target directory: {}", ctx.target_dir);
    if !unit.description.is_empty() {
        let _ = writeln!(out, "Description: {}", unit.description);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Source files");
    for source in &unit.sources {
        if project.source.directory.is_empty() {
            let _ = writeln!(out, "- {}", source);
        } else {
            let _ = writeln!(out, "- {}/{}", project.source.directory, source);
        }
    }

    if !unit.depends_on.is_empty() {
        let _ = writeln!(out);
        let deps: Vec<&str> = unit.depends_on.iter().map(String::as_str).collect();
        let _ = writeln!(out, "Already migrated dependencies: {}", deps.join(", "));
    }

    if unit.kind == UnitKind::Feature
        && let Some(feature) = project.features.iter().find(|f| f.id() == unit.id)
        && !feature.test_cases.is_empty()
    {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Feature test cases");
        for case in &feature.test_cases {
            let _ = writeln!(out, "- `{}` -> `{}`", case.input, case.output);
        }
    }

    if !project.test_inputs.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Validation inputs");
        for input in &project.test_inputs {
            let _ = writeln!(out, "- `{}`", input);
        }
    }

    if let Some(feedback) = ctx.feedback {
        let _ = writeln!(out);
        let _ = writeln!(out, "## FEEDBACK FROM PREVIOUS ATTEMPT");
        match feedback {
            Feedback::Gate { gate_name, excerpt } => {
                let _ = writeln!(out, "Quality gate `{}` failed:", gate_name);
                let _ = writeln!(out, "```");
                let _ = writeln!(out, "{}", excerpt.trim_end());
                let _ = writeln!(out, "```");
            }
            Feedback::Agent { phase, message } => {
                let _ = writeln!(out, "The {} phase failed: {}", phase, message);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use porter_common::{FeatureDef, ModuleDef, TestCase};

    fn project() -> Project {
        let mut project = Project::with_modules(
            "calc",
            vec![
                ModuleDef::new("lexer", "lexer.py", &[]),
                ModuleDef::new("parser", "parser.py", &["lexer"]),
            ],
        );
        project.source.directory = "src/calc".into();
        project.test_inputs = vec!["1 2 +".into()];
        let mut feature = FeatureDef::new("numbers", &["lexer"], &[]);
        feature.test_cases.push(TestCase {
            input: "5".into(),
            output: "$5$".into(),
        });
        project.features.push(feature);
        project
    }

    #[test]
    fn test_module_instructions() {
        let project = project();
        let unit = WorkUnit::new("parser", UnitKind::Module)
            .with_deps(["lexer"])
            .with_sources(vec!["parser.py".into()]);
        let text = build_instructions(&InstructionContext {
            project: &project,
            target: "rust",
            target_dir: "calc-rs",
            unit: &unit,
            phase: UnitPhase::Analyzing,
            attempt: 1,
            feedback: None,
        });
        assert!(text.starts_with("# module parser: migrate calc from python to rust"));
        assert!(text.contains("Phase: analyzing (attempt 1)"));
        assert!(text.contains("- src/calc/parser.py"));
        assert!(text.contains("Already migrated dependencies: lexer"));
        assert!(text.contains("- `1 2 +`"));
        assert!(!text.contains("FEEDBACK"));
    }

    #[test]
    fn test_feature_instructions_list_test_cases() {
        let project = project();
        let unit =
            WorkUnit::new("numbers", UnitKind::Feature).with_sources(vec!["lexer.py".into()]);
        let text = build_instructions(&InstructionContext {
            project: &project,
            target: "go",
            target_dir: "calc-go",
            unit: &unit,
            phase: UnitPhase::Contracting,
            attempt: 1,
            feedback: None,
        });
        assert!(text.contains("## Feature test cases"));
        assert!(text.contains("- `5` -> `$5$`"));
    }

    #[test]
    fn test_retry_carries_gate_feedback() {
        let project = project();
        let unit = WorkUnit::new("lexer", UnitKind::Module);
        let feedback = Feedback::Gate {
            gate_name: "test".into(),
            excerpt: "assertion failed: left == right\n".into(),
        };
        let text = build_instructions(&InstructionContext {
            project: &project,
            target: "rust",
            target_dir: "calc-rs",
            unit: &unit,
            phase: UnitPhase::Contracting,
            attempt: 2,
            feedback: Some(&feedback),
        });
        assert!(text.contains("## FEEDBACK FROM PREVIOUS ATTEMPT"));
        assert!(text.contains("Quality gate `test` failed:"));
        assert!(text.contains("assertion failed"));
    }

    #[test]
    fn test_instructions_are_deterministic() {
        let project = project();
        let unit = WorkUnit::new("lexer", UnitKind::Module);
        let ctx = InstructionContext {
            project: &project,
            target: "rust",
            target_dir: "calc-rs",
            unit: &unit,
            phase: UnitPhase::Reviewing,
            attempt: 1,
            feedback: None,
        };
        assert_eq!(build_instructions(&ctx), build_instructions(&ctx));
    }
}
