//! Prompt templates for the step loop and its advisory sub-calls.

use ravel_domain::{ChatMessage, Toolbox};

use crate::reflection::Reflection;

const SYSTEM_PREAMBLE: &str = "You are an expert assistant who solves tasks step by step. \
At each step, call one or more of the available tools, or write a short code snippet \
in a ```rhai block, then observe the results before deciding what to do next. \
When you have the answer, call the `final_answer` tool with it. \
Never call `final_answer` in the same step as a search or retrieval tool: \
wait until you have observed the retrieved data.";

const PLANNING_PROMPT: &str = "Before acting, write a short numbered plan for the task below. \
Mention the tools you intend to use by name. List known facts, facts still to look up, \
and the steps to reach the answer. End the plan with <end_plan>.";

const PLANNING_UPDATE_PROMPT: &str = "Here is the progress so far. Revise the plan for the \
remaining work, mentioning tools by name. End the plan with <end_plan>.";

const EVALUATION_PROMPT: &str = "Assess whether the task has been accomplished based on the \
history above. Reply with exactly one line starting with one of:\n\
DONE: <the final answer>\n\
CONTINUE: <what is still missing>\n\
STUCK: <why no progress is being made>\n\
Optionally add a second line `CONFIDENCE: <number between 0 and 1>`.";

const CRITIQUE_PROMPT: &str = "Review the output below against the task. If it is correct \
and complete, reply `LGTM`. Otherwise reply `ISSUE: <what is wrong> | FIX: <how to fix it>`.";

const REFINE_PROMPT: &str = "Rewrite the output below so that it addresses the feedback. \
Reply with the improved output only.";

const ROUTING_PROMPT: &str = "A tool returned the output below. Decide how much of it the \
agent needs to continue the task. Reply with\n\
DECISION: summary_only | full_output | needs_retry | irrelevant\n\
SUMMARY: <a short summary of the relevant content>";

/// System prompt listing tools, custom instructions and lessons learned.
pub fn system_prompt(
    toolbox: &Toolbox,
    instructions: Option<&str>,
    reflections: &[Reflection],
) -> String {
    let mut prompt = String::from(SYSTEM_PREAMBLE);
    prompt.push_str("\n\nAvailable tools:\n");
    for tool in toolbox.iter() {
        prompt.push_str(&format!(
            "- {}: {} Inputs: {}\n",
            tool.name(),
            tool.description(),
            tool.inputs()
        ));
    }
    if let Some(instructions) = instructions {
        prompt.push('\n');
        prompt.push_str(instructions.trim());
        prompt.push('\n');
    }
    if !reflections.is_empty() {
        prompt.push_str("\nLessons from earlier attempts at similar tasks:\n");
        for reflection in reflections {
            prompt.push_str(&format!("- {}\n", reflection.reflection_text));
        }
    }
    prompt
}

pub fn planning_messages(task: &str, tool_names: &[String], progress: Option<&str>) -> Vec<ChatMessage> {
    let mut user = match progress {
        Some(progress) if !progress.trim().is_empty() => {
            format!("{PLANNING_UPDATE_PROMPT}\n\nTask:\n{task}\n\nProgress:\n{progress}")
        }
        _ => format!("{PLANNING_PROMPT}\n\nTask:\n{task}"),
    };
    user.push_str(&format!("\n\nTools: {}", tool_names.join(", ")));
    vec![
        ChatMessage::system("You are a world-class planner."),
        ChatMessage::user(user),
    ]
}

/// Evaluation appends its instruction to the run history.
pub fn evaluation_messages(task: &str, history: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(format!(
        "You evaluate an agent's progress on this task:\n{task}"
    ))];
    messages.extend(history);
    messages.push(ChatMessage::user(EVALUATION_PROMPT));
    messages
}

/// Evaluation of a single candidate output, used as refinement feedback.
pub fn output_evaluation_messages(task: &str, output: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!("You evaluate answers to this task:\n{task}")),
        ChatMessage::user(format!("Output:\n{output}\n\n{EVALUATION_PROMPT}")),
    ]
}

pub fn critique_messages(task: &str, output: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("You are a strict reviewer."),
        ChatMessage::user(format!("{CRITIQUE_PROMPT}\n\nTask:\n{task}\n\nOutput:\n{output}")),
    ]
}

pub fn refine_messages(task: &str, output: &str, issue: &str, fix: Option<&str>) -> Vec<ChatMessage> {
    let mut feedback = format!("Issue: {issue}");
    if let Some(fix) = fix {
        feedback.push_str(&format!("\nSuggested fix: {fix}"));
    }
    vec![
        ChatMessage::system("You improve outputs based on review feedback."),
        ChatMessage::user(format!(
            "{REFINE_PROMPT}\n\nTask:\n{task}\n\nOutput:\n{output}\n\n{feedback}"
        )),
    ]
}

pub fn routing_messages(task: &str, tool_name: &str, observation: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!("You triage tool output for an agent working on:\n{task}")),
        ChatMessage::user(format!("{ROUTING_PROMPT}\n\nTool: {tool_name}\nOutput:\n{observation}")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravel_domain::fakes::StaticTool;
    use ravel_domain::FinalAnswerTool;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_system_prompt_lists_tools_and_lessons() {
        let toolbox = Toolbox::new()
            .with_tool(Arc::new(StaticTool::new("web_search", json!("r"))))
            .with_tool(Arc::new(FinalAnswerTool));
        let lesson = Reflection::new(
            "t",
            1,
            "snapshot",
            "Check arity first.",
            crate::reflection::ReflectionOutcome::Failure,
        );
        let prompt = system_prompt(&toolbox, Some("Answer in French."), &[lesson]);
        assert!(prompt.contains("- web_search:"));
        assert!(prompt.contains("- final_answer:"));
        assert!(prompt.contains("Answer in French."));
        assert!(prompt.contains("Check arity first."));
    }

    #[test]
    fn test_planning_messages_switch_to_update() {
        let first = planning_messages("t", &["calc".into()], None);
        assert!(first[1].content.starts_with(PLANNING_PROMPT));
        let update = planning_messages("t", &["calc".into()], Some("Step 1: called calc."));
        assert!(update[1].content.contains("Progress:\nStep 1"));
        assert!(update[1].content.ends_with("Tools: calc"));
    }

    #[test]
    fn test_evaluation_messages_wrap_history() {
        let messages = evaluation_messages("t", vec![ChatMessage::user("New task:\nt")]);
        assert_eq!(messages.len(), 3);
        assert!(messages[2].content.contains("DONE:"));
    }
}
