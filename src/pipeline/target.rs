//! Where a file lives on disk while tools run against it

use std::path::{Path, PathBuf};

use crate::core::models::ProjectId;

#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub project: ProjectId,
    /// File name without extension
    pub name: String,
    pub ext: String,
    pub lang: String,
    /// Dotted package, empty for the default package
    pub package: String,
    /// Source root the package tree is laid out under
    pub dir: PathBuf,
}

impl Target {
    pub fn new(
        project: ProjectId,
        file_name: &str,
        lang: impl Into<String>,
        package: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        let (name, ext) = match file_name.rsplit_once('.') {
            Some((name, ext)) if !name.is_empty() => (name.to_string(), ext.to_string()),
            _ => (file_name.to_string(), String::new()),
        };
        Self {
            project,
            name,
            ext,
            lang: lang.into(),
            package: package.into(),
            dir: dir.into(),
        }
    }

    pub fn full_name(&self) -> String {
        if self.ext.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.ext)
        }
    }

    pub fn package_path(&self) -> PathBuf {
        self.package
            .split('.')
            .filter(|s| !s.is_empty())
            .fold(self.dir.clone(), |path, segment| path.join(segment))
    }

    pub fn file_path(&self) -> PathBuf {
        self.package_path().join(self.full_name())
    }

    /// Package qualified name of the compiled unit
    pub fn executable(&self) -> String {
        if self.package.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.package, self.name)
        }
    }

    /// Write the file contents to [`Self::file_path`]
    pub async fn save(&self, data: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.file_path();
        tokio::fs::create_dir_all(self.package_path()).await?;
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    /// Substitute placeholders in a command template.
    ///
    /// Known placeholders: `{file}`, `{name}`, `{package}`, `{executable}`,
    /// `{src_dir}`, `{package_dir}` and `{tests_dir}`. `{tests_dir}` is
    /// empty when no tests were provisioned.
    pub fn render(&self, template: &[String], tests_dir: Option<&Path>) -> Vec<String> {
        let file = self.file_path().display().to_string();
        let src_dir = self.dir.display().to_string();
        let package_dir = self.package_path().display().to_string();
        let tests_dir = tests_dir.map(|p| p.display().to_string()).unwrap_or_default();
        let executable = self.executable();
        let full_name = self.full_name();

        template
            .iter()
            .map(|arg| {
                arg.replace("{file}", &file)
                    .replace("{name}", &full_name)
                    .replace("{package}", &self.package)
                    .replace("{executable}", &executable)
                    .replace("{src_dir}", &src_dir)
                    .replace("{package_dir}", &package_dir)
                    .replace("{tests_dir}", &tests_dir)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target::new(ProjectId::new(), "Triangle.java", "java", "za.ac.sun", "/stage/1")
    }

    #[test]
    fn test_paths() {
        let t = target();
        assert_eq!(t.name, "Triangle");
        assert_eq!(t.ext, "java");
        assert_eq!(t.package_path(), PathBuf::from("/stage/1/za/ac/sun"));
        assert_eq!(t.file_path(), PathBuf::from("/stage/1/za/ac/sun/Triangle.java"));
        assert_eq!(t.executable(), "za.ac.sun.Triangle");
    }

    #[test]
    fn test_default_package() {
        let t = Target::new(ProjectId::new(), "Main.java", "java", "", "/stage/2");
        assert_eq!(t.file_path(), PathBuf::from("/stage/2/Main.java"));
        assert_eq!(t.executable(), "Main");
    }

    #[test]
    fn test_render_placeholders() {
        let template: Vec<String> = ["java", "-cp", "{src_dir}:{tests_dir}", "{executable}", "{file}"]
            .into_iter()
            .map(String::from)
            .collect();
        let rendered = target().render(&template, Some(Path::new("/tests/p")));
        assert_eq!(
            rendered,
            vec![
                "java",
                "-cp",
                "/stage/1:/tests/p",
                "za.ac.sun.Triangle",
                "/stage/1/za/ac/sun/Triangle.java"
            ]
        );
    }

    #[tokio::test]
    async fn test_save_creates_package_tree() {
        let dir = tempfile::tempdir().unwrap();
        let t = Target::new(ProjectId::new(), "Main.java", "java", "a.b", dir.path());
        let path = t.save(b"class Main {}").await.unwrap();
        assert_eq!(path, dir.path().join("a/b/Main.java"));
        assert_eq!(std::fs::read(path).unwrap(), b"class Main {}");
    }
}
