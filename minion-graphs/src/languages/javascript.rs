use std::path::Path;

use crate::{FileId, FileSummary, ImportSpec, Result};

use super::{FileIndex, LanguageSupport, ecma};

#[derive(Debug)]
pub struct JavaScriptSupport;

impl LanguageSupport for JavaScriptSupport {
    fn id(&self) -> &'static str {
        "javascript"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["js", "jsx", "mjs", "cjs"]
    }

    fn tree_sitter_language(&self) -> tree_sitter::Language {
        tree_sitter_javascript::LANGUAGE.into()
    }

    fn summarize(
        &self,
        tree: &tree_sitter::Tree,
        source: &str,
        _path: &Path,
    ) -> Result<FileSummary> {
        Ok(ecma::summarize(tree, source))
    }

    fn resolve_import(
        &self,
        import: &ImportSpec,
        from: &FileId,
        index: &FileIndex,
    ) -> Vec<FileId> {
        ecma::resolve(import, from, index)
    }

    fn may_be_local(&self, import: &ImportSpec, _index: &FileIndex) -> bool {
        ecma::is_relative(&import.module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_commonjs_requires() {
        let source = r#"
const { parse } = require("./parser");
const fs = require("fs");

function build(input) {
  const extra = require('../extra');
  return parse(input);
}

module.exports = { build };
"#;
        let summary =
            super::super::summarize_source(&JavaScriptSupport, source, Path::new("lib/build.js"))
                .unwrap();
        let modules: Vec<&str> = summary.imports.iter().map(|i| i.module.as_str()).collect();
        assert_eq!(modules, vec!["./parser", "fs", "../extra"]);
        let names: Vec<&str> = summary.definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["fs", "build"]);
    }

    #[test]
    fn probes_index_files_and_extensions() {
        let ids: Vec<FileId> = ["lib/parser.js", "lib/extra/index.mjs"]
            .iter()
            .map(|p| FileId::new(*p))
            .collect();
        let index = FileIndex::new(&ids);
        let from = FileId::new("lib/sub/build.js");

        let hit = JavaScriptSupport.resolve_import(&ImportSpec::module("../parser"), &from, &index);
        assert_eq!(hit, vec![FileId::new("lib/parser.js")]);
        let hit = JavaScriptSupport.resolve_import(&ImportSpec::module("../extra"), &from, &index);
        assert_eq!(hit, vec![FileId::new("lib/extra/index.mjs")]);
    }
}
