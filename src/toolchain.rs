//! Registry of supported languages.
//!
//! The set of languages is closed: every [`Language`] variant maps to exactly
//! one [`Toolchain`] descriptor, so once a request has been parsed into a
//! `Language` the engine can never meet an unknown toolchain.
//!
//! Command templates are rendered relative to the job workspace with two
//! placeholders:
//!
//! - `{source}`: the materialized source file, e.g. `<job-id>.cpp`
//! - `{artifact}`: the compiled binary, e.g. `<job-id>.out`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoderunError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "cpp")]
    Cpp,
    #[serde(rename = "c")]
    C,
    #[serde(rename = "py")]
    Python,
}

/// Per-language recipe used by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Toolchain {
    pub language: Language,
    /// File extension of the materialized source, without the dot.
    pub extension: &'static str,
    pub compile: Option<&'static [&'static str]>,
    pub run: &'static [&'static str],
    /// Default container image for the Docker sandbox.
    pub image: &'static str,
}

const CPP: Toolchain = Toolchain {
    language: Language::Cpp,
    extension: "cpp",
    compile: Some(&[
        "g++",
        "-std=c++17",
        "-O2",
        "-pipe",
        "-o",
        "{artifact}",
        "{source}",
    ]),
    run: &["./{artifact}"],
    image: "gcc:13",
};

const C: Toolchain = Toolchain {
    language: Language::C,
    extension: "c",
    compile: Some(&["gcc", "-std=c11", "-O2", "-pipe", "-o", "{artifact}", "{source}", "-lm"]),
    run: &["./{artifact}"],
    image: "gcc:13",
};

const PYTHON: Toolchain = Toolchain {
    language: Language::Python,
    extension: "py",
    compile: None,
    run: &["python3", "-B", "{source}"],
    image: "python:3.12-slim",
};

impl Language {
    pub const ALL: [Language; 3] = [Language::Cpp, Language::C, Language::Python];

    /// Canonical identifier used on the wire.
    pub fn id(&self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::Python => "py",
        }
    }

    pub fn toolchain(&self) -> &'static Toolchain {
        match self {
            Language::Cpp => &CPP,
            Language::C => &C,
            Language::Python => &PYTHON,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Language {
    type Err = CoderunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpp" | "c++" | "cxx" | "cc" => Ok(Language::Cpp),
            "c" => Ok(Language::C),
            "py" | "python" | "python3" => Ok(Language::Python),
            _ => Err(CoderunError::UnsupportedLanguage(s.to_string())),
        }
    }
}

impl Toolchain {
    pub fn source_file(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.extension)
    }

    pub fn artifact_file(&self, stem: &str) -> String {
        format!("{}.out", stem)
    }

    pub fn compile_command(&self, stem: &str) -> Option<Vec<String>> {
        self.compile.map(|template| self.render(template, stem))
    }

    pub fn run_command(&self, stem: &str) -> Vec<String> {
        self.render(self.run, stem)
    }

    fn render(&self, template: &[&str], stem: &str) -> Vec<String> {
        let source = self.source_file(stem);
        let artifact = self.artifact_file(stem);
        template
            .iter()
            .map(|part| {
                part.replace("{source}", &source)
                    .replace("{artifact}", &artifact)
            })
            .collect()
    }
}
