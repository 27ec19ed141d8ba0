use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

/// Rich output only for a terminal, and never when `--plain` or `NO_COLOR`
/// is set.
pub(crate) fn resolve_output_style(plain: bool, no_color: bool, is_terminal: bool) -> OutputStyle {
    if plain || no_color || !is_terminal {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

pub(crate) fn current_output_style(plain: bool) -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    resolve_output_style(plain, no_color, std::io::stdout().is_terminal())
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

pub(crate) struct TerminalSpinner {
    style: OutputStyle,
    label: String,
    spinner: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_error(self, message: &str) {
        eprintln!("{}", render_status_line(self.style, "error", message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.style, title) {
            println!();
            println!("{}", colorize(section_style(), &line));
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    /// Plan lines keep their `key=value` shape; rich output only tints the
    /// leading record name.
    pub(crate) fn print_plan_lines(self, lines: &[String]) {
        for line in lines {
            println!("{}", render_plan_line(self.style, line));
        }
    }

    pub(crate) fn start_spinner(self, label: &str) -> TerminalSpinner {
        let spinner = if self.style == OutputStyle::Rich {
            let spinner = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}") {
                spinner.set_style(style.tick_chars("-=~* "));
            }
            spinner.set_message(label.to_string());
            spinner.enable_steady_tick(Duration::from_millis(80));
            Some(spinner)
        } else {
            None
        };

        TerminalSpinner {
            style: self.style,
            label: label.to_string(),
            spinner,
            started_at: Instant::now(),
        }
    }
}

impl TerminalSpinner {
    pub(crate) fn finish(mut self) {
        let Some(spinner) = self.spinner.take() else {
            return;
        };
        spinner.finish_and_clear();
        if let Some(line) = render_elapsed_line(self.style, &self.label, self.started_at.elapsed()) {
            println!("{line}");
        }
    }

    pub(crate) fn abandon(mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let badge = format!("[{}]", status.to_ascii_uppercase());
            match status_style(status) {
                Some(badge_style) => format!("{} {message}", colorize(badge_style, &badge)),
                None => format!("{badge} {message}"),
            }
        }
    }
}

fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(format!("== {title} ==")),
    }
}

fn render_plan_line(style: OutputStyle, line: &str) -> String {
    if style == OutputStyle::Plain {
        return line.to_string();
    }
    match line.split_once(' ') {
        Some((record, rest)) => format!("{} {rest}", colorize(record_style(record), record)),
        None => colorize(record_style(line), line),
    }
}

fn render_elapsed_line(style: OutputStyle, label: &str, elapsed: Duration) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }
    Some(format!(
        "{} complete in {}",
        colorize(label_style(), label),
        format_elapsed(elapsed)
    ))
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn status_style(status: &str) -> Option<Style> {
    let color = match status {
        "ok" => AnsiColor::BrightGreen,
        "warn" => AnsiColor::BrightYellow,
        "error" => AnsiColor::BrightRed,
        _ => return None,
    };
    Some(Style::new().fg_color(Some(color.into())).effects(Effects::BOLD))
}

fn record_style(record: &str) -> Style {
    let color = match record {
        "change_remove" => AnsiColor::BrightRed,
        "change_preserve" => AnsiColor::BrightYellow,
        "change_merge" | "config_merge" => AnsiColor::BrightMagenta,
        "migration" => AnsiColor::BrightCyan,
        _ => AnsiColor::BrightBlue,
    };
    Style::new().fg_color(Some(color.into()))
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}
