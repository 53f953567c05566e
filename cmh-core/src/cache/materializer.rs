// cmh-core/src/cache/materializer.rs
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use cmh_common::error::{CmhError, Result};
use cmh_common::ResolvedModule;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;
use walkdir::WalkDir;

/// Produces the files of one resolved module inside `destination`.
///
/// `destination` is an empty staging directory owned by the cache; the
/// implementation only writes into it and never moves it. Fetching (from git,
/// an archive, a local checkout) is entirely up to the implementation.
pub trait Materializer: Send + Sync {
    fn materialize<'a>(
        &'a self,
        module: &'a ResolvedModule,
        destination: &'a Path,
    ) -> BoxFuture<'a, Result<()>>;
}

/// File holding the effective parameters as CMake `set()` calls.
pub const PARAMETERS_FILENAME: &str = "cmh-parameters.cmake";

/// Copies module sources out of a local checkout of the module repository.
///
/// The source of a module is `<root>/<descriptor.path>` when the descriptor
/// names a path and `<root>/<name>` otherwise; it may be a single file or a
/// directory.
#[derive(Debug, Clone)]
pub struct LocalSourceMaterializer {
    root: PathBuf,
}

impl LocalSourceMaterializer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn source_of(&self, module: &ResolvedModule) -> PathBuf {
        match module.descriptor.path.as_deref() {
            Some(path) if !path.trim().is_empty() => self.root.join(path),
            _ => self.root.join(&module.name),
        }
    }
}

impl Materializer for LocalSourceMaterializer {
    fn materialize<'a>(
        &'a self,
        module: &'a ResolvedModule,
        destination: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        let source = self.source_of(module);
        let destination = destination.to_path_buf();
        async move {
            let parameters = render_parameters(module)?;
            tokio::task::spawn_blocking(move || {
                copy_source(&source, &destination)?;
                cmh_aio::fs::atomic_write_file(
                    &destination.join(PARAMETERS_FILENAME),
                    parameters.as_bytes(),
                )
            })
            .await
            .map_err(|e| CmhError::Generic(format!("copy task failed: {e}")))?
        }
        .boxed()
    }
}

fn copy_source(source: &Path, destination: &Path) -> Result<()> {
    debug!("Copying {} into {}", source.display(), destination.display());
    if source.is_file() {
        let file_name = source
            .file_name()
            .ok_or_else(|| CmhError::Generic(format!("invalid source path {}", source.display())))?;
        std::fs::copy(source, destination.join(file_name))?;
        return Ok(());
    }
    if !source.is_dir() {
        return Err(CmhError::Generic(format!(
            "module source {} does not exist",
            source.display()
        )));
    }

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| CmhError::Generic(format!("cannot read {}: {e}", source.display())))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| CmhError::Generic(e.to_string()))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            cmh_aio::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn render_parameters(module: &ResolvedModule) -> Result<String> {
    let mut out = format!("# {} {}\n", module.name, module.version);
    for (key, value) in &module.parameters {
        if !is_cmake_identifier(key) {
            return Err(CmhError::InvalidParameter {
                module: module.name.clone(),
                parameter: key.clone(),
                reason: "not a valid CMake variable name".to_string(),
            });
        }
        let _ = writeln!(out, "set({key} \"{}\")", escape_quoted(&value.cmake_value()));
    }
    Ok(out)
}

fn is_cmake_identifier(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+' | '/'))
}

/// Escapes text for a CMake quoted argument so it is taken literally.
fn escape_quoted(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cmh_common::ModuleDescriptor;
    use semver::Version;

    use super::*;

    fn resolved(name: &str, path: Option<&str>) -> ResolvedModule {
        let mut descriptor = ModuleDescriptor::new(name, vec![Version::new(1, 0, 0)]);
        descriptor.path = path.map(str::to_string);
        ResolvedModule::new(Arc::new(descriptor), Version::new(1, 0, 0)).with_parameter("ASAN", true)
    }

    #[tokio::test]
    async fn copies_a_directory_tree_and_writes_parameters() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(repo.join("sanitizers/sub")).unwrap();
        std::fs::write(repo.join("sanitizers/sanitizers.cmake"), "# module").unwrap();
        std::fs::write(repo.join("sanitizers/sub/extra.cmake"), "# extra").unwrap();
        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();

        let materializer = LocalSourceMaterializer::new(&repo);
        let module = resolved("sanitizers", None);
        materializer.materialize(&module, &dest).await.unwrap();

        assert!(dest.join("sanitizers.cmake").is_file());
        assert!(dest.join("sub/extra.cmake").is_file());
        let params = std::fs::read_to_string(dest.join(PARAMETERS_FILENAME)).unwrap();
        assert!(params.contains("set(ASAN \"ON\")"));
    }

    #[test]
    fn string_values_are_quoted_once_and_escaped() {
        let module = resolved("sanitizers", None)
            .with_parameter("MODE", "thin")
            .with_parameter("EVIL", "a\") message(FATAL_ERROR x")
            .with_parameter("PATHS", "C:\\sdk;${HOME}")
            .with_parameter("LEVEL", 3i64);
        let rendered = render_parameters(&module).unwrap();

        assert!(rendered.contains("set(MODE \"thin\")\n"), "{rendered}");
        assert!(rendered.contains("set(LEVEL \"3\")\n"), "{rendered}");
        assert!(
            rendered.contains(r#"set(EVIL "a\") message(FATAL_ERROR x")"#),
            "{rendered}"
        );
        assert!(rendered.contains(r#"set(PATHS "C:\\sdk;\${HOME}")"#), "{rendered}");
        assert!(!rendered.contains("\"\""));
    }

    #[test]
    fn parameter_names_that_are_not_cmake_variables_are_rejected() {
        let module = resolved("sanitizers", None).with_parameter("X) message(boom", true);
        assert!(matches!(
            render_parameters(&module),
            Err(CmhError::InvalidParameter { parameter, .. }) if parameter == "X) message(boom"
        ));
    }

    #[tokio::test]
    async fn single_file_modules_use_the_descriptor_path() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(repo.join("modules/testing")).unwrap();
        std::fs::write(repo.join("modules/testing/coverage.cmake"), "# cov").unwrap();
        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();

        let materializer = LocalSourceMaterializer::new(&repo);
        let module = resolved("coverage", Some("modules/testing/coverage.cmake"));
        materializer.materialize(&module, &dest).await.unwrap();
        assert!(dest.join("coverage.cmake").is_file());

        let missing = resolved("ghost", None);
        assert!(materializer.materialize(&missing, &dest).await.is_err());
    }
}
