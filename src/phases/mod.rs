//! Static phase catalogs per run mode.
//!
//! A `PhaseSpec` declares everything the executor needs to run one phase:
//! dependencies, the model instruction, the output schema, which output
//! fields the compactor treats as headline vs detail, and the token
//! allowances used for budget estimates.

use crate::models::RunMode;

/// The opening phase in every catalog. Its first pass is the only place a
/// clarifying question may pause the run.
pub const FIRST_PHASE: &str = "framing";

/// The closing phase in every catalog. Its output becomes the report
/// appended to chat history on completion.
pub const REPORT_PHASE: &str = "report";

/// Static definition of one analysis phase.
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub name: &'static str,
    pub depends_on: &'static [&'static str],
    /// Model instruction prompt for this phase.
    pub instruction: &'static str,
    /// Top-level JSON fields the completion must carry.
    pub required_fields: &'static [&'static str],
    /// Fields always included when this phase's output is compacted into a
    /// downstream context.
    pub headline_fields: &'static [&'static str],
    /// Fields included only while the downstream context budget allows.
    pub detail_fields: &'static [&'static str],
    /// Expected output size in tokens, used for budget reservations.
    pub output_allowance: u64,
    /// Token budget for this phase's compacted input context.
    pub context_budget: u64,
}

const FRAMING: PhaseSpec = PhaseSpec {
    name: "framing",
    depends_on: &[],
    instruction: "Frame the submitted challenge: restate the core problem, name the \
        decision at stake, and list the key questions an analysis must answer. If the \
        challenge is too ambiguous to frame, return a single clarifying_question field \
        instead of guessing. Respond with a JSON object.",
    required_fields: &["title", "summary", "key_questions"],
    headline_fields: &["title", "summary"],
    detail_fields: &["key_questions"],
    output_allowance: 1_500,
    context_budget: 6_000,
};

const TEACHING: PhaseSpec = PhaseSpec {
    name: "teaching",
    depends_on: &["framing"],
    instruction: "Extract the transferable lessons relevant to the framed problem: \
        principles, failure patterns, and rules of thumb from comparable situations. \
        Respond with a JSON object.",
    required_fields: &["summary", "lessons"],
    headline_fields: &["summary"],
    detail_fields: &["lessons"],
    output_allowance: 2_000,
    context_budget: 8_000,
};

const PRECEDENTS: PhaseSpec = PhaseSpec {
    name: "precedents",
    depends_on: &["framing"],
    instruction: "Survey precedents for the framed problem: prior attempts, analogous \
        systems, and their outcomes. Note what distinguished successes from failures. \
        Respond with a JSON object.",
    required_fields: &["summary", "precedents"],
    headline_fields: &["summary"],
    detail_fields: &["precedents"],
    output_allowance: 2_000,
    context_budget: 8_000,
};

const CONCEPTS: PhaseSpec = PhaseSpec {
    name: "concepts",
    depends_on: &["framing", "teaching", "precedents"],
    instruction: "Synthesize candidate solution concepts from the framing, lessons, \
        and precedents. Each concept gets a name, mechanism, and the assumption it \
        leans on hardest. Respond with a JSON object.",
    required_fields: &["summary", "concepts"],
    headline_fields: &["summary"],
    detail_fields: &["concepts"],
    output_allowance: 3_000,
    context_budget: 12_000,
};

const EVALUATION: PhaseSpec = PhaseSpec {
    name: "evaluation",
    depends_on: &["concepts"],
    instruction: "Evaluate the candidate concepts against the key questions: score \
        feasibility, impact, and risk, and rank them with a short rationale each. \
        Respond with a JSON object.",
    required_fields: &["summary", "scores"],
    headline_fields: &["summary"],
    detail_fields: &["scores"],
    output_allowance: 2_000,
    context_budget: 10_000,
};

const REPORT: PhaseSpec = PhaseSpec {
    name: "report",
    depends_on: &["framing", "concepts", "evaluation"],
    instruction: "Write the final report in markdown: framing recap, leading \
        concepts, evaluation verdict, and recommended next steps. Respond with a \
        JSON object.",
    required_fields: &["summary", "report_markdown"],
    headline_fields: &["summary"],
    detail_fields: &["report_markdown"],
    output_allowance: 4_000,
    context_budget: 16_000,
};

const SCAN: PhaseSpec = PhaseSpec {
    name: "scan",
    depends_on: &["framing"],
    instruction: "Scan the problem space broadly: adjacent domains, weak signals, and \
        unconventional angles worth a closer look. Breadth over depth. Respond with a \
        JSON object.",
    required_fields: &["summary", "findings"],
    headline_fields: &["summary"],
    detail_fields: &["findings"],
    output_allowance: 2_500,
    context_budget: 8_000,
};

const DISCOVERY_CONCEPTS: PhaseSpec = PhaseSpec {
    name: "concepts",
    depends_on: &["framing", "scan"],
    instruction: "Turn the scan findings into exploratory concepts: what each would \
        look like, and the cheapest experiment to test it. Respond with a JSON \
        object.",
    required_fields: &["summary", "concepts"],
    headline_fields: &["summary"],
    detail_fields: &["concepts"],
    output_allowance: 3_000,
    context_budget: 10_000,
};

const DISCOVERY_REPORT: PhaseSpec = PhaseSpec {
    name: "report",
    depends_on: &["framing", "concepts"],
    instruction: "Write the discovery report in markdown: framing recap, the most \
        promising directions, and suggested experiments. Respond with a JSON object.",
    required_fields: &["summary", "report_markdown"],
    headline_fields: &["summary"],
    detail_fields: &["report_markdown"],
    output_allowance: 3_500,
    context_budget: 12_000,
};

const CLAIMS: PhaseSpec = PhaseSpec {
    name: "claims",
    depends_on: &["framing"],
    instruction: "Enumerate the material claims the proposal rests on: technical, \
        market, and operational. Mark each as load-bearing or incidental. Respond \
        with a JSON object.",
    required_fields: &["summary", "claims"],
    headline_fields: &["summary"],
    detail_fields: &["claims"],
    output_allowance: 2_500,
    context_budget: 10_000,
};

const EVIDENCE: PhaseSpec = PhaseSpec {
    name: "evidence",
    depends_on: &["claims"],
    instruction: "Assess the evidence behind each load-bearing claim: what supports \
        it, what contradicts it, and what is simply unverified. Respond with a JSON \
        object.",
    required_fields: &["summary", "evidence"],
    headline_fields: &["summary"],
    detail_fields: &["evidence"],
    output_allowance: 3_000,
    context_budget: 14_000,
};

const RISKS: PhaseSpec = PhaseSpec {
    name: "risks",
    depends_on: &["claims"],
    instruction: "Identify the risks if the load-bearing claims fail: severity, \
        likelihood, and available mitigations. Respond with a JSON object.",
    required_fields: &["summary", "risks"],
    headline_fields: &["summary"],
    detail_fields: &["risks"],
    output_allowance: 3_000,
    context_budget: 14_000,
};

const FEASIBILITY: PhaseSpec = PhaseSpec {
    name: "feasibility",
    depends_on: &["evidence", "risks"],
    instruction: "Judge overall feasibility from the evidence and risk pictures: \
        what must be true for this to work, and how plausible that is. Respond with \
        a JSON object.",
    required_fields: &["summary", "verdict"],
    headline_fields: &["summary"],
    detail_fields: &["verdict"],
    output_allowance: 2_500,
    context_budget: 16_000,
};

const DILIGENCE_EVALUATION: PhaseSpec = PhaseSpec {
    name: "evaluation",
    depends_on: &["feasibility"],
    instruction: "Evaluate the proposal as an investment of effort: strengths, \
        dealbreakers, and the conditions under which the verdict would flip. \
        Respond with a JSON object.",
    required_fields: &["summary", "assessment"],
    headline_fields: &["summary"],
    detail_fields: &["assessment"],
    output_allowance: 2_500,
    context_budget: 14_000,
};

const DILIGENCE_REPORT: PhaseSpec = PhaseSpec {
    name: "report",
    depends_on: &["framing", "feasibility", "evaluation"],
    instruction: "Write the due-diligence report in markdown: framing recap, claim \
        assessment, feasibility verdict, risk register, and recommendation. Respond \
        with a JSON object.",
    required_fields: &["summary", "report_markdown"],
    headline_fields: &["summary"],
    detail_fields: &["report_markdown"],
    output_allowance: 4_000,
    context_budget: 20_000,
};

/// The ordered phase catalog for a run mode. Order here is declaration
/// order; execution order comes from the dependency graph.
pub fn catalog(mode: RunMode) -> &'static [PhaseSpec] {
    match mode {
        RunMode::Standard => &[FRAMING, TEACHING, PRECEDENTS, CONCEPTS, EVALUATION, REPORT],
        RunMode::Discovery => &[FRAMING, SCAN, DISCOVERY_CONCEPTS, DISCOVERY_REPORT],
        RunMode::DueDiligence => &[
            FRAMING,
            CLAIMS,
            EVIDENCE,
            RISKS,
            FEASIBILITY,
            DILIGENCE_EVALUATION,
            DILIGENCE_REPORT,
        ],
    }
}

pub fn spec_for(mode: RunMode, name: &str) -> Option<&'static PhaseSpec> {
    catalog(mode).iter().find(|spec| spec.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_sizes() {
        assert_eq!(catalog(RunMode::Standard).len(), 6);
        assert_eq!(catalog(RunMode::Discovery).len(), 4);
        assert_eq!(catalog(RunMode::DueDiligence).len(), 7);
    }

    #[test]
    fn test_every_catalog_opens_and_closes_consistently() {
        for mode in [RunMode::Standard, RunMode::Discovery, RunMode::DueDiligence] {
            let phases = catalog(mode);
            assert_eq!(phases.first().unwrap().name, FIRST_PHASE);
            assert!(phases.first().unwrap().depends_on.is_empty());
            assert_eq!(phases.last().unwrap().name, REPORT_PHASE);
        }
    }

    #[test]
    fn test_dependencies_reference_declared_phases() {
        for mode in [RunMode::Standard, RunMode::Discovery, RunMode::DueDiligence] {
            let names: HashSet<&str> = catalog(mode).iter().map(|p| p.name).collect();
            for spec in catalog(mode) {
                for dep in spec.depends_on {
                    assert!(names.contains(dep), "{} depends on undeclared {}", spec.name, dep);
                }
            }
        }
    }

    #[test]
    fn test_headline_and_detail_fields_are_required() {
        for mode in [RunMode::Standard, RunMode::Discovery, RunMode::DueDiligence] {
            for spec in catalog(mode) {
                for field in spec.headline_fields.iter().chain(spec.detail_fields) {
                    assert!(
                        spec.required_fields.contains(field),
                        "{}: compaction field {} missing from schema",
                        spec.name,
                        field
                    );
                }
            }
        }
    }

    #[test]
    fn test_spec_for_lookup() {
        assert!(spec_for(RunMode::Standard, "teaching").is_some());
        assert!(spec_for(RunMode::Discovery, "teaching").is_none());
    }
}
