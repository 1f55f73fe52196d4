//! Metadata-only classification of files as text or binary.
//!
//! The scanner never opens files, so this works purely on names.

use serde::{Deserialize, Serialize};
use std::path::Path;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "adoc", "asciidoc",
    "rs", "py", "js", "ts", "jsx", "tsx", "mjs", "cjs", "java", "kt", "kts", "scala",
    "c", "cc", "cpp", "cxx", "h", "hpp", "hxx", "go", "rb", "php", "swift", "cs", "fs",
    "hs", "ml", "clj", "ex", "exs", "erl", "dart", "elm", "lua", "pl", "r", "jl", "zig",
    "nim", "gleam", "vue", "svelte", "html", "htm", "xml", "css", "scss", "sass", "less",
    "svg", "json", "jsonl", "yaml", "yml", "toml", "ini", "cfg", "conf", "properties",
    "env", "sql", "graphql", "gql", "proto", "prisma", "sh", "bash", "zsh", "fish", "ps1",
    "bat", "cmd", "cmake", "gradle", "tex", "bib", "csv", "tsv", "log", "diff", "patch",
    "lock", "sum", "mod", "nix", "just", "ipynb", "pyi", "d.ts",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "app", "deb", "rpm", "msi", "zip", "tar", "gz", "bz2",
    "xz", "7z", "rar", "jar", "war", "class", "pyc", "pyo", "o", "obj", "a", "lib",
    "rlib", "rmeta", "pdb", "wasm", "bin", "dat", "db", "sqlite", "sqlite3", "pdf", "doc",
    "docx", "xls", "xlsx", "ppt", "pptx", "mp3", "mp4", "avi", "mkv", "mov", "webm", "wav",
    "flac", "jpg", "jpeg", "png", "gif", "bmp", "ico", "icns", "webp", "tiff", "tif",
    "heic", "heif", "avif", "ttf", "otf", "woff", "woff2",
];

/// Extension-less files that are conventionally text.
const TEXT_FILE_NAMES: &[&str] = &[
    "makefile", "dockerfile", "containerfile", "justfile", "license", "readme",
    "changelog", "gemfile", "rakefile", "procfile", "jenkinsfile", "vagrantfile",
    ".gitignore", ".gitattributes", ".editorconfig", ".dockerignore", ".npmignore",
];

/// Coarse content classification of a file node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Binary,
    #[default]
    Unknown,
}

/// Classifies a file by its name alone.
pub fn content_type_for(path: &Path) -> ContentType {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return ContentType::Unknown;
    };
    let file_name = file_name.to_lowercase();

    if TEXT_FILE_NAMES.contains(&file_name.as_str()) {
        return ContentType::Text;
    }

    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => {
            let ext = ext.to_lowercase();
            if TEXT_EXTENSIONS.contains(&ext.as_str()) {
                ContentType::Text
            } else if BINARY_EXTENSIONS.contains(&ext.as_str()) {
                ContentType::Binary
            } else {
                ContentType::Unknown
            }
        }
        None => ContentType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_by_extension() {
        assert_eq!(content_type_for(Path::new("src/main.rs")), ContentType::Text);
        assert_eq!(content_type_for(Path::new("logo.PNG")), ContentType::Binary);
        assert_eq!(content_type_for(Path::new("data.xyz")), ContentType::Unknown);
    }

    #[test]
    fn test_known_file_names_are_text() {
        assert_eq!(content_type_for(Path::new("Makefile")), ContentType::Text);
        assert_eq!(content_type_for(Path::new("a/.gitignore")), ContentType::Text);
        assert_eq!(content_type_for(Path::new("noext")), ContentType::Unknown);
    }
}
