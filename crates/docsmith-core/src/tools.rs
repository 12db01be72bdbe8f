//! External conversion tools: what they are called, which options they
//! accept, and which diagnostics mean "your document is broken".

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::options::{OptionKind, OptionSpec, OptionValue};

/// Static description of an external conversion binary.
#[derive(Debug)]
pub struct ToolSpec {
    pub name: &'static str,
    /// Arguments always passed before the user options.
    pub fixed_args: &'static [&'static str],
    pub options: &'static [OptionSpec],
    /// Substrings of the tool's stderr that identify a malformed payload.
    pub malformed_input_patterns: &'static [&'static str],
    /// Arguments that make the tool print its version and exit 0.
    pub probe_args: &'static [&'static str],
}

impl ToolSpec {
    pub fn defaults(&self) -> Vec<(&'static str, OptionValue)> {
        match self.name {
            "pdftohtml" | "pdftotext" => {
                vec![("outputEncoding", OptionValue::Text("UTF-8".to_string()))]
            }
            _ => Vec::new(),
        }
    }
}

const POPPLER_SYNTAX_ERROR: &[&str] = &["Syntax Error:"];

pub static PDFTOHTML: ToolSpec = ToolSpec {
    name: "pdftohtml",
    fixed_args: &["-c", "-s"],
    options: &[
        OptionSpec::new("exchangePdfLinks", "-p", OptionKind::Bool),
        OptionSpec::new("extractHidden", "-hidden", OptionKind::Bool),
        OptionSpec::new("firstPageToConvert", "-f", OptionKind::Number),
        OptionSpec::new("ignoreImages", "-i", OptionKind::Bool),
        OptionSpec::new("imageFormat", "-fmt", OptionKind::Text),
        OptionSpec::new("lastPageToConvert", "-l", OptionKind::Number),
        OptionSpec::new("noDrm", "-nodrm", OptionKind::Bool),
        OptionSpec::new("noMergeParagraph", "-nomerge", OptionKind::Bool),
        OptionSpec::new("outputEncoding", "-enc", OptionKind::Text),
        OptionSpec::new("ownerPassword", "-opw", OptionKind::Text),
        OptionSpec::new("userPassword", "-upw", OptionKind::Text),
        OptionSpec::new("wordBreakThreshold", "-wbt", OptionKind::Number),
        OptionSpec::new("zoom", "-zoom", OptionKind::Number),
    ],
    malformed_input_patterns: POPPLER_SYNTAX_ERROR,
    probe_args: &["-v"],
};

pub static PDFTOTEXT: ToolSpec = ToolSpec {
    name: "pdftotext",
    fixed_args: &[],
    options: &[
        OptionSpec::new("boundingBoxXhtml", "-bbox", OptionKind::Bool),
        OptionSpec::new("boundingBoxXhtmlLayout", "-bbox-layout", OptionKind::Bool),
        OptionSpec::new("cropHeight", "-H", OptionKind::Number),
        OptionSpec::new("cropWidth", "-W", OptionKind::Number),
        OptionSpec::new("cropXAxis", "-x", OptionKind::Number),
        OptionSpec::new("cropYAxis", "-y", OptionKind::Number),
        OptionSpec::new("eolConvention", "-eol", OptionKind::Text),
        OptionSpec::new("firstPageToConvert", "-f", OptionKind::Number),
        OptionSpec::new("fixedWidthLayout", "-fixed", OptionKind::Number),
        OptionSpec::new("generateHtmlMetaFile", "-htmlmeta", OptionKind::Bool),
        OptionSpec::new("lastPageToConvert", "-l", OptionKind::Number),
        OptionSpec::new("maintainLayout", "-layout", OptionKind::Bool),
        OptionSpec::new("noDiagonalText", "-nodiag", OptionKind::Bool),
        OptionSpec::new("noPageBreaks", "-nopgbrk", OptionKind::Bool),
        OptionSpec::new("outputEncoding", "-enc", OptionKind::Text),
        OptionSpec::new("ownerPassword", "-opw", OptionKind::Text),
        OptionSpec::new("rawLayout", "-raw", OptionKind::Bool),
        OptionSpec::new("userPassword", "-upw", OptionKind::Text),
    ],
    malformed_input_patterns: POPPLER_SYNTAX_ERROR,
    probe_args: &["-v"],
};

pub static PANDOC: ToolSpec = ToolSpec {
    name: "pandoc",
    fixed_args: &["--from", "docx"],
    options: &[],
    malformed_input_patterns: &["couldn't unpack docx container"],
    probe_args: &["--version"],
};

pub static UNRTF: ToolSpec = ToolSpec {
    name: "unrtf",
    fixed_args: &["--nopict"],
    options: &[],
    malformed_input_patterns: &[],
    probe_args: &["--version"],
};

pub static ANTIWORD: ToolSpec = ToolSpec {
    name: "antiword",
    fixed_args: &[],
    options: &[],
    malformed_input_patterns: &["is not a Word Document"],
    probe_args: &[],
};

pub static ALL_TOOLS: [&ToolSpec; 5] = [&PDFTOHTML, &PDFTOTEXT, &PANDOC, &UNRTF, &ANTIWORD];

/// Where to find each binary. Bare names are resolved through `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryPaths {
    /// Directory holding the Poppler binaries; `None` uses `PATH`.
    pub poppler_dir: Option<PathBuf>,
    pub pandoc: PathBuf,
    pub unrtf: PathBuf,
    pub antiword: PathBuf,
}

impl Default for BinaryPaths {
    fn default() -> Self {
        Self {
            poppler_dir: None,
            pandoc: PathBuf::from("pandoc"),
            unrtf: PathBuf::from("unrtf"),
            antiword: PathBuf::from("antiword"),
        }
    }
}

impl BinaryPaths {
    pub fn for_tool(&self, tool: &ToolSpec) -> PathBuf {
        match tool.name {
            "pdftohtml" | "pdftotext" => match &self.poppler_dir {
                Some(dir) => dir.join(tool.name),
                None => PathBuf::from(tool.name),
            },
            "pandoc" => self.pandoc.clone(),
            "unrtf" => self.unrtf.clone(),
            "antiword" => self.antiword.clone(),
            other => PathBuf::from(other),
        }
    }

    /// Point every tool at `dir/<tool name>`. Used by tests and packaging.
    pub fn all_in(dir: &Path) -> Self {
        Self {
            poppler_dir: Some(dir.to_path_buf()),
            pandoc: dir.join("pandoc"),
            unrtf: dir.join("unrtf"),
            antiword: dir.join("antiword"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poppler_tools_resolve_inside_poppler_dir() {
        let paths = BinaryPaths {
            poppler_dir: Some(PathBuf::from("/opt/poppler/bin")),
            ..BinaryPaths::default()
        };
        assert_eq!(
            paths.for_tool(&PDFTOHTML),
            PathBuf::from("/opt/poppler/bin/pdftohtml")
        );
        assert_eq!(paths.for_tool(&PANDOC), PathBuf::from("pandoc"));
    }

    #[test]
    fn default_paths_use_bare_names() {
        let paths = BinaryPaths::default();
        for tool in ALL_TOOLS {
            assert_eq!(paths.for_tool(tool), PathBuf::from(tool.name));
        }
    }

    #[test]
    fn option_names_are_unique_per_tool() {
        for tool in ALL_TOOLS {
            let mut names: Vec<_> = tool.options.iter().map(|o| o.name).collect();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), tool.options.len(), "{}", tool.name);
        }
    }

    #[test]
    fn poppler_defaults_to_utf8() {
        let defaults = PDFTOHTML.defaults();
        assert_eq!(
            defaults,
            vec![("outputEncoding", OptionValue::Text("UTF-8".to_string()))]
        );
        assert!(PANDOC.defaults().is_empty());
    }
}
