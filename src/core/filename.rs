//! Legacy file name encoding
//!
//! Older clients do not send structured metadata. Instead every file name
//! carries it as underscore separated tokens:
//!
//! `[<package segment>_]*<name>.<ext>_<time ns>_<number>_<modification>`
//!
//! Only the last three tokens are mandatory.

use thiserror::Error;

use super::models::{FileType, Modification};

pub const SOURCE_EXT: &str = ".java";
pub const COMPILED_EXT: &str = ".class";
pub const SOURCE_LANG: &str = "java";

/// Package segments which mark a build output folder
const OUT_FOLDERS: [&str; 2] = ["src", "bin"];

const NANOS_PER_MILLI: i64 = 1_000_000;

#[derive(Debug, Error, PartialEq)]
pub enum NameError {
    #[error("encoded name {0:?} does not have enough parameters")]
    TooShort(String),
    #[error("{token:?} in name {name:?} is not a valid {field}")]
    BadNumber {
        name: String,
        token: String,
        field: &'static str,
    },
    #[error("{0:?} is not a plain file name")]
    UnsafeName(String),
    #[error("{0:?} is not a valid package")]
    UnsafePackage(String),
}

/// Metadata recovered from an encoded file name
#[derive(Debug, Clone, PartialEq)]
pub struct FileName {
    pub name: String,
    pub package: String,
    pub kind: FileType,
    pub lang: Option<&'static str>,
    /// Milliseconds since the epoch
    pub time: i64,
    pub number: u64,
    pub modification: Modification,
}

/// Classify a logical file name by its extension
pub fn classify(name: &str) -> (FileType, Option<&'static str>) {
    if name.ends_with(SOURCE_EXT) {
        (FileType::Source, Some(SOURCE_LANG))
    } else if name.ends_with(COMPILED_EXT) {
        (FileType::Executable, Some(SOURCE_LANG))
    } else {
        (FileType::Change, None)
    }
}

pub fn parse(encoded: &str) -> Result<FileName, NameError> {
    let elems: Vec<&str> = encoded.split('_').collect();
    let n = elems.len();
    if n < 3 {
        return Err(NameError::TooShort(encoded.to_string()));
    }

    let modification = Modification::from(elems[n - 1].to_string());
    let number = elems[n - 2]
        .parse::<u64>()
        .map_err(|_| bad_number(encoded, elems[n - 2], "sequence number"))?;
    let nanos = elems[n - 3]
        .parse::<i64>()
        .map_err(|_| bad_number(encoded, elems[n - 3], "timestamp"))?;

    let mut name = String::new();
    let mut package = String::new();
    if n > 3 {
        name = elems[n - 4].to_string();
        let mut segments: Vec<&str> = Vec::new();
        for segment in &elems[..n - 4] {
            if OUT_FOLDERS.contains(segment) {
                segments.clear();
            } else {
                segments.push(segment);
            }
        }
        package = segments.join(".");
    }

    check(&name, &package)?;
    let (kind, lang) = classify(&name);
    Ok(FileName {
        name,
        package,
        kind,
        lang,
        time: nanos / NANOS_PER_MILLI,
        number,
        modification,
    })
}

/// Inverse of [`parse`]
pub fn encode(name: &str, package: &str, time: i64, number: u64, modification: Modification) -> String {
    let mut tokens: Vec<String> = Vec::new();
    if !name.is_empty() {
        tokens.extend(
            package
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        tokens.push(name.to_string());
    }
    tokens.push((time * NANOS_PER_MILLI).to_string());
    tokens.push(number.to_string());
    tokens.push(modification.as_char().to_string());
    tokens.join("_")
}

/// Names and packages end up as paths under the staging directory. A name
/// must be a single path component and package segments are limited to
/// `[A-Za-z0-9_$]`. Both may be empty.
pub fn check(name: &str, package: &str) -> Result<(), NameError> {
    if !name.is_empty() && (name == "." || name == ".." || name.contains(['/', '\\', '\0'])) {
        return Err(NameError::UnsafeName(name.to_string()));
    }
    let segment_ok = |s: &str| {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    };
    if !package.is_empty() && !package.split('.').all(segment_ok) {
        return Err(NameError::UnsafePackage(package.to_string()));
    }
    Ok(())
}

fn bad_number(name: &str, token: &str, field: &'static str) -> NameError {
    NameError::BadNumber {
        name: name.to_string(),
        token: token.to_string(),
        field,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_name() {
        let parsed = parse("za_ac_sun_Main.java_1375180000000000000_7_c").unwrap();
        assert_eq!(parsed.name, "Main.java");
        assert_eq!(parsed.package, "za.ac.sun");
        assert_eq!(parsed.kind, FileType::Source);
        assert_eq!(parsed.lang, Some("java"));
        assert_eq!(parsed.time, 1_375_180_000_000);
        assert_eq!(parsed.number, 7);
        assert_eq!(parsed.modification, Modification::Saved);
    }

    #[test]
    fn test_parse_minimum_tokens() {
        let parsed = parse("1000000_0_l").unwrap();
        assert_eq!(parsed.name, "");
        assert_eq!(parsed.package, "");
        assert_eq!(parsed.kind, FileType::Change);
        assert_eq!(parsed.lang, None);
        assert_eq!(parsed.modification, Modification::Launched);
    }

    #[test]
    fn test_parse_rejects_short_names() {
        assert_eq!(
            parse("Main.java_3"),
            Err(NameError::TooShort("Main.java_3".into()))
        );
        assert!(matches!(
            parse("Main.java_abc_1_c"),
            Err(NameError::BadNumber { field: "timestamp", .. })
        ));
        assert!(matches!(
            parse("Main.java_100_x_c"),
            Err(NameError::BadNumber { field: "sequence number", .. })
        ));
    }

    #[test]
    fn test_parse_strips_output_folders() {
        let parsed = parse("project_src_kselect_KSelect.class_2000000_3_r").unwrap();
        assert_eq!(parsed.package, "kselect");
        assert_eq!(parsed.kind, FileType::Executable);
        assert_eq!(parsed.modification, Modification::Removed);
    }

    #[test]
    fn test_parse_unknown_modification() {
        let parsed = parse("notes.txt_5000000_2_q").unwrap();
        assert_eq!(parsed.kind, FileType::Change);
        assert_eq!(parsed.modification, Modification::Unknown);
    }

    #[test]
    fn test_names_cannot_leave_the_source_tree() {
        assert!(check("Main.java", "za.ac.sun").is_ok());
        assert!(check("", "").is_ok());
        assert!(check("Inner$1.class", "a_b.c$d").is_ok());

        for name in ["..", ".", "../Pwn.java", "x/Pwn.java", "x\\Pwn.java", "/etc/Pwn.java"] {
            assert_eq!(check(name, ""), Err(NameError::UnsafeName(name.into())), "{}", name);
        }
        for package in ["x/tmp/abs", "a..b", ".a", "a.", "a.-b", "a./etc"] {
            assert_eq!(
                check("Main.java", package),
                Err(NameError::UnsafePackage(package.into())),
                "{}",
                package
            );
        }
        assert_eq!(
            parse("x/y_Pwn.java_1000000_0_c"),
            Err(NameError::UnsafePackage("x/y".into()))
        );
        assert_eq!(
            parse("a_../Pwn.java_1000000_0_c"),
            Err(NameError::UnsafeName("../Pwn.java".into()))
        );
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let cases = [
            ("Main.java", "za.ac.sun", Modification::Saved),
            ("Util.class", "", Modification::Added),
            ("diff.patch", "a.b", Modification::To),
        ];
        for (idx, (name, package, modification)) in cases.into_iter().enumerate() {
            let time = 1_700_000_000_123 + idx as i64;
            let encoded = encode(name, package, time, idx as u64, modification);
            let parsed = parse(&encoded).unwrap();
            assert_eq!(parsed.name, name);
            assert_eq!(parsed.package, package);
            assert_eq!(parsed.time, time);
            assert_eq!(parsed.number, idx as u64);
            assert_eq!(parsed.modification, modification);
            assert_eq!(parsed.kind, classify(name).0);
        }
    }
}
