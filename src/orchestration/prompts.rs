//! Prompts sent to agent sessions.

use crate::artifacts::ChunkArtifacts;
use crate::core::{Phase, WorkUnit};

/// Opening prompt for a unit's current phase.
pub fn phase_prompt(unit: &WorkUnit) -> String {
    let doc = ChunkArtifacts::relative_doc_path(&unit.id);
    let doc = doc.display();
    let id = &unit.id;
    match unit.phase {
        Phase::Goal => format!(
            "You are working on work unit `{id}`. Refine its goal in {doc}. \
             Keep the YAML front matter: set `status: FUTURE` and list every file or \
             directory you expect to touch under `code_paths`. Do not change code yet."
        ),
        Phase::Plan => format!(
            "Work unit `{id}` has a goal in {doc}. Write an implementation plan in \
             the same directory (PLAN.md). Update `code_paths` in the front matter if \
             the plan touches more files than the goal listed. Do not change code yet."
        ),
        Phase::Implement => format!(
            "Implement work unit `{id}` following its goal and plan in the directory \
             of {doc}. Set `status: IMPLEMENTING` while you work. Stay inside this \
             worktree and commit nothing outside it."
        ),
        Phase::Complete => format!(
            "Finish work unit `{id}`. Make sure the implementation matches {doc}, the \
             tests pass, and then set `status: ACTIVE` in its front matter to mark the \
             unit complete."
        ),
    }
}

/// Follow-up when the completion marker was not set after the COMPLETE phase.
pub fn completion_reminder(unit: &WorkUnit, marker_status: &str, attempt: u32, max: u32) -> String {
    let doc = ChunkArtifacts::relative_doc_path(&unit.id);
    format!(
        "The completion marker in {} still reads `status: {marker_status}` \
         (check {attempt} of {max}). If the work is finished, set `status: ACTIVE`. \
         If something blocks you, say so and ask.",
        doc.display()
    )
}

/// Continuation carrying the operator's answer.
pub fn answer_prompt(answer: &str) -> String {
    format!("The operator answered your question:\n\n{answer}\n\nContinue the current phase.")
}
