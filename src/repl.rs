// File: src/repl.rs
//
// Interactive REPL (Read-Eval-Print Loop) for the sandboxed script engine.
// Provides an interactive shell with:
// - Multi-line input support for functions, loops, and control structures
// - Command history with up/down arrow navigation
// - Special commands (:help, :clear, :quit, :reset)
// - Persistent context state across inputs

use crate::context::{Context, EvalError};
use crate::value::Value;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// REPL session that maintains one script context and handles user interaction.
pub struct Repl {
    context: Context,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        let mut context = Context::new();
        context.set_print_sink(|line| println!("{}", line));
        Ok(Repl { context, editor })
    }

    fn show_banner(&self) {
        println!("{}", "╔══════════════════════════════════════════════════════╗".bright_cyan());
        println!("{}", "║              Script Engine REPL                     ║".bright_cyan());
        println!("{}", "╚══════════════════════════════════════════════════════╝".bright_cyan());
        println!();
        println!(
            "  {} Use {}{}{}{}",
            "Welcome!".bright_green(),
            ":".bright_blue(),
            "help".bright_yellow(),
            " for commands or ".bright_blue(),
            ":quit".bright_yellow()
        );
        println!("  {} Multi-line input: end with unclosed braces", "Tip:".bright_magenta());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "> ".bright_green().to_string()
            } else {
                "... ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (Ctrl+C to interrupt, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "\nGoodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles a `:`-prefixed command. Returns true to keep the loop going.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            ":reset" | ":r" => {
                self.context = Context::new();
                self.context.set_print_sink(|line| println!("{}", line));
                println!("{}", "Context reset".bright_green());
                true
            }
            _ => {
                println!(
                    "{} unknown command: {}. Type {}{}{}",
                    "Error:".bright_red(),
                    cmd.bright_yellow(),
                    ":".bright_blue(),
                    "help".bright_yellow(),
                    " for available commands.".bright_blue()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "REPL Commands:".bright_cyan().bold());
        println!();
        println!("  {}{}  Display this help message", ":help".bright_yellow(), " or :h   ".dimmed());
        println!("  {}{}  Exit the REPL", ":quit".bright_yellow(), " or :q   ".dimmed());
        println!("  {}{}  Clear the screen", ":clear".bright_yellow(), " or :c  ".dimmed());
        println!("  {}{}  Reset the context", ":reset".bright_yellow(), " or :r ".dimmed());
        println!();
        println!("{}", "Multi-line Input:".bright_cyan().bold());
        println!();
        println!("  Leave braces, brackets, or parentheses unclosed to continue");
        println!("  on the next line. Close them to execute the statement.");
        println!();
    }

    fn eval_input(&mut self, input: &str) {
        if input.trim().is_empty() {
            return;
        }
        match self.context.eval(input) {
            Ok(value) => self.print_value(&value),
            Err(err) => self.print_error(&err),
        }
    }

    fn print_value(&self, value: &Value) {
        if matches!(value, Value::Undefined) {
            return;
        }
        println!("{} {}", "=>".bright_blue(), self.context.to_display_string(value).bright_white());
    }

    fn print_error(&self, err: &EvalError) {
        println!("{} {}", "Error:".bright_red().bold(), err.to_string().bright_red());
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("failed to create REPL")
    }
}

/// Whether `input`'s brackets/braces/parens balance out and no string is left
/// open, the same bracket-counting heuristic most line-editors use to decide
/// whether to keep reading more lines before handing the buffer to the parser.
fn is_input_complete(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return true;
    }

    let chars: Vec<char> = trimmed.chars().collect();
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut escape_next = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if in_line_comment {
            if ch == '\n' {
                in_line_comment = false;
            }
            i += 1;
            continue;
        }
        if in_block_comment {
            if ch == '*' && chars.get(i + 1) == Some(&'/') {
                in_block_comment = false;
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }
        if escape_next {
            escape_next = false;
            i += 1;
            continue;
        }
        match in_string {
            Some(quote) => match ch {
                '\\' => escape_next = true,
                c if c == quote => in_string = None,
                _ => {}
            },
            None => match ch {
                '\\' => escape_next = true,
                '"' | '\'' => in_string = Some(ch),
                '/' if chars.get(i + 1) == Some(&'/') => {
                    in_line_comment = true;
                    i += 2;
                    continue;
                }
                '/' if chars.get(i + 1) == Some(&'*') => {
                    in_block_comment = true;
                    i += 2;
                    continue;
                }
                '{' | '[' | '(' => depth += 1,
                '}' | ']' | ')' => depth -= 1,
                _ => {}
            },
        }
        i += 1;
    }

    in_string.is_none() && !in_block_comment && depth <= 0
}
