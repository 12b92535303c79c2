use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::PathBuf;
use walkdir::WalkDir;

/// Directories holding this crate's own Rust sources. Everything else in the
/// checkout (vendored reference material, build output) is left alone.
const SOURCE_DIRS: [&str; 4] = ["analysis", "cli", "tests", "benches"];

/// A source rule: lines matching `pattern` are reported when `applies` accepts them.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    applies: fn(&str) -> bool,
}

const RULES: [Rule; 5] = [
    Rule {
        name: "underscore-prefixed binding; use the value or remove it",
        pattern: r"\b_[a-zA-Z0-9_]+\b",
        applies: binds_underscore_name,
    },
    Rule {
        name: "#[allow(dead_code)]; use the item or remove it",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        applies: always,
    },
    Rule {
        name: "comment narrates an edit instead of describing the code",
        pattern: r"(//|/\*).*(?:FIX|CORRECTED|NEW|CHANGE|MODIF|UPDATE)",
        applies: always,
    },
    Rule {
        name: "'**' emphasis outside a doc comment",
        pattern: r"(//|/\*).*\*\*",
        applies: is_plain_comment,
    },
    Rule {
        name: "comment written entirely in capitals",
        pattern: r"^\s*(//|/\*)",
        applies: is_shouted_comment,
    },
];

fn always(_: &str) -> bool {
    true
}

/// Code on the line with string literals and any trailing comment removed.
fn code_only(line: &str) -> String {
    let unquoted: String = line.split('"').step_by(2).collect::<Vec<_>>().join(" ");
    match unquoted.find("//") {
        Some(start) => unquoted[..start].to_string(),
        None => unquoted,
    }
}

fn binds_underscore_name(line: &str) -> bool {
    let code = code_only(line);
    let chars: Vec<char> = code.chars().collect();
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    chars.iter().enumerate().any(|(i, &c)| {
        c == '_'
            && (i == 0 || !is_word(chars[i - 1]))
            && chars.get(i + 1).is_some_and(|&next| is_word(next))
    })
}

fn is_plain_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    !(trimmed.starts_with("///") || trimmed.starts_with("//!"))
}

fn is_shouted_comment(line: &str) -> bool {
    let text = line
        .trim_start()
        .trim_start_matches(['/', '!', '*'])
        .trim_end_matches("*/");
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

/// Collects the offending lines of one file for one rule.
struct Hits<'r> {
    rule: &'r Rule,
    lines: Vec<String>,
}

impl Sink for Hits<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let text = String::from_utf8_lossy(mat.bytes());
        let text = text.trim_end();
        if (self.rule.applies)(text) {
            let line_number = mat.line_number().unwrap_or(0);
            self.lines.push(format!("{line_number}: {text}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS
        .into_iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn check_sources() -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    let mut report = String::new();
    for rule in &RULES {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        for path in rust_sources() {
            let mut hits = Hits {
                rule,
                lines: Vec::new(),
            };
            searcher.search_path(&matcher, &path, &mut hits)?;
            for line in hits.lines {
                report.push_str(&format!("  {}:{line}\n    {}\n", path.display(), rule.name));
            }
        }
    }
    if report.is_empty() {
        Ok(())
    } else {
        Err(format!("\n❌ Source checks failed:\n{report}").into())
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = check_sources() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
