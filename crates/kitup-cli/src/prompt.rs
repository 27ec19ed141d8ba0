use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use kitup_upgrade::{render_plan_lines, Confirm, UpgradePlan};

use crate::render::TerminalRenderer;

/// Shows the plan and asks on stdin before anything is changed.
pub(crate) struct StdinConfirm {
    renderer: TerminalRenderer,
}

impl StdinConfirm {
    pub(crate) fn new(renderer: TerminalRenderer) -> Self {
        Self { renderer }
    }
}

impl Confirm for StdinConfirm {
    fn confirm(&self, plan: &UpgradePlan) -> Result<bool> {
        self.renderer.print_section("upgrade plan");
        self.renderer.print_plan_lines(&render_plan_lines(plan));

        let question = format!(
            "Upgrade {} from {} to {}?",
            plan.files.install_dir.display(),
            plan.from_version,
            plan.to_version
        );
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stdout();
        prompt_yes_no(&mut input, &mut output, &question)
    }
}

/// Only an explicit yes counts; an empty line or end of input declines.
pub(crate) fn prompt_yes_no<R, W>(input: &mut R, output: &mut W, question: &str) -> Result<bool>
where
    R: BufRead,
    W: Write,
{
    write!(output, "{question} [y/N] ").context("failed to write confirmation prompt")?;
    output.flush().context("failed to flush confirmation prompt")?;

    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("failed to read confirmation answer")?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}
