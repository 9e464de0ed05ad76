use std::fmt::Write;

use super::context::RagContext;
use crate::types::BugRecord;

const MAX_PROMPT_CASES: usize = 3;

const FOOTER: &str = r#"

**Task:** Analyze this bug and provide a comprehensive fix.

**Your response should include:**

1. **Root Cause Analysis**
   - What is causing this bug?
   - Why is it happening in this specific context?

2. **Debugging Checklist**
   - Step-by-step debugging approach
   - What to check first, second, third

3. **Fix Implementation**
   - Provide complete, working code fixes
   - Include filename and line numbers
   - Explain each change

4. **Testing Strategy**
   - How to verify the fix works
   - Edge cases to test

5. **Prevention**
   - How to avoid this bug in the future
   - Best practices
"#;

fn or_na(value: Option<&str>) -> &str {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => "N/A",
    }
}

/// Render the generation prompt. Section order is fixed: target fields,
/// similar cases, user code, screenshot notes, instructions.
pub fn assemble_prompt(target: &BugRecord, context: &RagContext) -> String {
    let mut prompt = String::new();

    // Writing to a String cannot fail
    let _ = write!(
        prompt,
        "**TARGET BUG TO FIX:**\n\
         Bug ID: {}\n\
         Title: {}\n\
         Description: {}\n\
         Category: {}\n\
         Client Type: {}\n\
         Severity: {}\n",
        target.id,
        target.title,
        or_na(Some(&target.description)),
        or_na(target.category.as_deref()),
        or_na(Some(&target.client_type)),
        or_na(Some(&target.severity)),
    );

    if !context.is_empty() {
        let _ = write!(
            prompt,
            "\n\n**CONTEXT: Similar Solved Bugs ({} cases)**\n",
            context.len()
        );
        for (n, case) in context.cases.iter().take(MAX_PROMPT_CASES).enumerate() {
            let _ = write!(
                prompt,
                "\n[Case {} - {:.1}% similar]\n- Solution: {}\n",
                n + 1,
                case.similarity_percentage,
                case.solution_excerpt
            );
        }
    }

    if let Some(code) = target.code.as_deref().filter(|c| !c.trim().is_empty()) {
        let lang = target
            .code_language
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or("unknown");
        let _ = write!(
            prompt,
            "\n\n**USER'S CODE ({}):**\n```{}\n{}\n```\n",
            lang.to_uppercase(),
            lang.to_lowercase(),
            code.trim_end()
        );
    }

    if let Some(notes) = target
        .screenshot_notes
        .as_deref()
        .filter(|n| !n.trim().is_empty())
    {
        let _ = write!(prompt, "\n**Screenshot Context:** {notes}\n");
    }

    prompt.push_str(FOOTER);
    prompt
}
