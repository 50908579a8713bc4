use std::path::Path;

use crate::{FileId, FileSummary, ImportSpec, Result};

use super::{FileIndex, LanguageSupport, ecma};

#[derive(Debug)]
pub struct TypeScriptSupport;

impl LanguageSupport for TypeScriptSupport {
    fn id(&self) -> &'static str {
        "typescript"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ts", "tsx", "mts", "cts"]
    }

    fn tree_sitter_language(&self) -> tree_sitter::Language {
        tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
    }

    fn tree_sitter_language_for(&self, path: &Path) -> tree_sitter::Language {
        if path.extension().is_some_and(|ext| ext == "tsx") {
            tree_sitter_typescript::LANGUAGE_TSX.into()
        } else {
            self.tree_sitter_language()
        }
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
    use crate::SymbolKind;

    #[test]
    fn extracts_exports_and_imports() {
        let source = r#"
import { Engine, type Config as C } from "./engine";
import React from "react";
export * from "../shared/types";

export interface Options { depth: number }
export type Id = string;
export enum Mode { Fast }
export const DEFAULT_DEPTH = 2;
export class Runner {}
function helper() {}

const lazy = () => import("./lazy");
"#;
        let summary = super::super::summarize_source(
            &TypeScriptSupport,
            source,
            Path::new("src/runner.ts"),
        )
        .unwrap();
        let names: Vec<&str> = summary.definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Options", "Id", "Mode", "DEFAULT_DEPTH", "Runner", "helper", "lazy"]
        );
        assert_eq!(summary.definitions[0].kind, SymbolKind::Type);

        let modules: Vec<&str> = summary.imports.iter().map(|i| i.module.as_str()).collect();
        assert_eq!(modules, vec!["./engine", "react", "../shared/types", "./lazy"]);
        assert_eq!(summary.imports[0].names, vec!["Engine", "Config"]);
    }

    #[test]
    fn tsx_files_use_the_tsx_grammar() {
        let source = "export const App = () => <div>hi</div>;\n";
        let summary =
            super::super::summarize_source(&TypeScriptSupport, source, Path::new("src/App.tsx"))
                .unwrap();
        assert_eq!(summary.definitions[0].name, "App");
    }

    #[test]
    fn resolves_relative_specifiers() {
        let ids: Vec<FileId> = ["src/engine.ts", "src/util/index.ts", "src/emit.ts"]
            .iter()
            .map(|p| FileId::new(*p))
            .collect();
        let index = FileIndex::new(&ids);
        let from = FileId::new("src/app.ts");

        let hit = TypeScriptSupport.resolve_import(&ImportSpec::module("./engine"), &from, &index);
        assert_eq!(hit, vec![FileId::new("src/engine.ts")]);
        let hit = TypeScriptSupport.resolve_import(&ImportSpec::module("./util"), &from, &index);
        assert_eq!(hit, vec![FileId::new("src/util/index.ts")]);
        let hit = TypeScriptSupport.resolve_import(&ImportSpec::module("./emit.js"), &from, &index);
        assert_eq!(hit, vec![FileId::new("src/emit.ts")]);
        assert!(
            TypeScriptSupport
                .resolve_import(&ImportSpec::module("react"), &from, &index)
                .is_empty()
        );
    }
}
