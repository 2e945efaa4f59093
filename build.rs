use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// First-party source trees checked by the lint policy.
const SOURCE_DIRS: [&str; 4] = ["encoding", "src", "tests", "benches"];

const STATUS_WORDS: &str =
    "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    StatusWord,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> String {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::StatusWord => format!(r"(//|/\*).*(?:{STATUS_WORDS})"),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::UppercaseComment => r"(//|/\*).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => {
                "Underscore-prefixed names are not allowed. Use the binding or remove it."
            }
            Rule::StatusWord => {
                "Comments must describe the code, not its history. Remove status words such as FIX, NEW, CHANGE or UPDATE."
            }
            Rule::StarsInComment => "The '**' pattern is only allowed in doc comments.",
            Rule::UppercaseComment => {
                "Comments where every alphabetic character is uppercase are not allowed."
            }
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] is not allowed. Use the code or remove it."
            }
        }
    }

    fn applies_to(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        let is_comment = trimmed.starts_with("//");
        match self {
            Rule::UnderscorePrefix => !is_comment && !only_in_strings(line),
            Rule::StatusWord | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !trimmed.starts_with("///") && !trimmed.starts_with("//!"),
            Rule::UppercaseComment => {
                let text = comment_text(line);
                let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }
        }
    }
}

// Collects the matching lines of one file for one rule.
struct ViolationCollector {
    rule: Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl ViolationCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} lint violations in {}:\n",
            self.violations.len(),
            self.file_path.display()
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.explanation()));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.applies_to(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

// True when every underscore-prefixed word on the line sits inside a string literal.
fn only_in_strings(line: &str) -> bool {
    if !line.contains('"') {
        return false;
    }
    line.split('"')
        .step_by(2)
        .flat_map(|code| code.split(|c: char| !c.is_alphanumeric() && c != '_'))
        .all(|word| word.len() < 2 || !word.starts_with('_'))
}

fn comment_text(line: &str) -> &str {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("//!")) {
        return rest.trim();
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return rest.trim();
    }
    match line.find("/*") {
        Some(idx) => {
            let body = &line[idx + 2..];
            body.find("*/").map_or(body, |end| &body[..end]).trim()
        }
        None => "",
    }
}

fn source_files() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS.into_iter().flat_map(|dir| {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn scan(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in source_files() {
        let mut collector = ViolationCollector::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let rules = [
        Rule::UnderscorePrefix,
        Rule::StatusWord,
        Rule::StarsInComment,
        Rule::UppercaseComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = scan(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
