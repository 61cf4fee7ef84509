//! Entities shared by the protocol handler, the store and the pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(
    /// Identifier of a project
    ProjectId
);
id_type!(
    /// Identifier of a submission
    SubmissionId
);
id_type!(
    /// Identifier of a stored file
    FileId
);
id_type!(
    /// Identifier of a tool result
    ResultId
);

/// Current time in milliseconds since the epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Submission protocol variant requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "file_remote")]
    FileRemote,
    #[serde(rename = "archive_remote")]
    ArchiveRemote,
    #[serde(rename = "archive_test")]
    ArchiveTest,
    #[serde(rename = "update")]
    Update,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::FileRemote => "file_remote",
            Mode::ArchiveRemote => "archive_remote",
            Mode::ArchiveTest => "archive_test",
            Mode::Update => "update",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User permission level.
///
/// Levels combine three bits: single-file submit, test submit and update
/// submit. `0` means no access at all, `7` grants everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(u8);

impl Permission {
    pub const NONE: Permission = Permission(0);
    pub const FILE: Permission = Permission(1);
    pub const TEST: Permission = Permission(2);
    pub const UPDATE: Permission = Permission(4);
    pub const ALL: Permission = Permission(7);

    pub fn from_level(level: u8) -> Option<Self> {
        (level <= Self::ALL.0).then_some(Self(level))
    }

    pub fn level(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Permission) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Whether this level may open a submission in the given mode
    pub fn allows(&self, mode: Mode) -> bool {
        match mode {
            Mode::FileRemote | Mode::ArchiveRemote => self.contains(Self::FILE),
            Mode::ArchiveTest => self.contains(Self::TEST),
            Mode::Update => self.contains(Self::UPDATE),
        }
    }

    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "none",
            1 => "file",
            2 => "test",
            3 => "file+test",
            4 => "update",
            5 => "update+file",
            6 => "update+test",
            _ => "all",
        }
    }
}

impl std::ops::BitOr for Permission {
    type Output = Permission;

    fn bitor(self, rhs: Self) -> Self::Output {
        Permission(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub password: String,
    pub salt: String,
    pub permission: Permission,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Language key into the configured tool chains
    pub lang: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub user: String,
    pub project: ProjectId,
    pub mode: Mode,
    /// Client supplied creation time (ms)
    pub time: i64,
}

impl Submission {
    pub fn new(user: impl Into<String>, project: ProjectId, mode: Mode, time: i64) -> Self {
        Self {
            id: SubmissionId::new(),
            user: user.into(),
            project,
            mode,
            time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// Source code in a compiled language
    #[serde(rename = "src")]
    Source,
    /// Compiled artifact
    #[serde(rename = "exec")]
    Executable,
    Archive,
    /// Change delta without a language
    Change,
    Test,
}

/// What the client's editor did to the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Modification {
    Saved,
    Removed,
    Launched,
    From,
    To,
    Added,
    #[default]
    Unknown,
}

impl Modification {
    pub fn from_char(c: char) -> Self {
        match c {
            'c' => Modification::Saved,
            'r' => Modification::Removed,
            'l' => Modification::Launched,
            'f' => Modification::From,
            't' => Modification::To,
            'a' => Modification::Added,
            _ => Modification::Unknown,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Modification::Saved => 'c',
            Modification::Removed => 'r',
            Modification::Launched => 'l',
            Modification::From => 'f',
            Modification::To => 't',
            Modification::Added => 'a',
            Modification::Unknown => 'u',
        }
    }
}

impl From<String> for Modification {
    fn from(value: String) -> Self {
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Modification::from_char(c),
            _ => Modification::Unknown,
        }
    }
}

impl From<Modification> for String {
    fn from(value: Modification) -> Self {
        value.as_char().to_string()
    }
}

/// One unit of payload received within a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: FileId,
    pub submission: SubmissionId,
    /// Ordinal within the submission, starting at 0
    pub number: u64,
    pub name: String,
    pub package: String,
    #[serde(rename = "type")]
    pub kind: FileType,
    #[serde(rename = "mod")]
    pub modification: Modification,
    /// Milliseconds since the epoch
    pub time: i64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Tool name -> latest result for that tool
    #[serde(default)]
    pub results: BTreeMap<String, ResultId>,
}

impl File {
    pub fn archive(submission: SubmissionId, number: u64, data: Vec<u8>) -> Self {
        Self {
            id: FileId::new(),
            submission,
            number,
            name: String::new(),
            package: String::new(),
            kind: FileType::Archive,
            modification: Modification::Unknown,
            time: now_millis(),
            data,
            results: BTreeMap::new(),
        }
    }
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file {} (#{} of submission {}, {:?} {}.{})",
            self.id, self.number, self.submission, self.kind, self.package, self.name
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Start,
    Timeout,
    End,
    OutOfMemory,
    BadDescriptor,
}

/// Structured failure attached to a tool result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// Recorded output of one tool run against one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: ResultId,
    pub file: FileId,
    pub tool: String,
    #[serde(with = "base64_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub stderr: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ToolError>,
    pub time: i64,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Raw bytes as base64 strings in JSON
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_allows_modes() {
        let file = Permission::FILE;
        assert!(file.allows(Mode::FileRemote));
        assert!(file.allows(Mode::ArchiveRemote));
        assert!(!file.allows(Mode::ArchiveTest));
        assert!(!file.allows(Mode::Update));

        let test = Permission::TEST;
        assert!(!test.allows(Mode::FileRemote));
        assert!(test.allows(Mode::ArchiveTest));

        let update_file = Permission::UPDATE | Permission::FILE;
        assert_eq!(update_file.level(), 5);
        assert!(update_file.allows(Mode::Update));
        assert!(update_file.allows(Mode::FileRemote));
        assert!(!update_file.allows(Mode::ArchiveTest));

        for mode in [Mode::FileRemote, Mode::ArchiveRemote, Mode::ArchiveTest, Mode::Update] {
            assert!(!Permission::NONE.allows(mode));
            assert!(Permission::ALL.allows(mode));
        }
    }

    #[test]
    fn test_permission_from_level() {
        assert_eq!(Permission::from_level(3).map(|p| p.name()), Some("file+test"));
        assert!(Permission::from_level(8).is_none());
    }

    #[test]
    fn test_mode_serde_names() {
        let mode: Mode = serde_json::from_str("\"file_remote\"").unwrap();
        assert_eq!(mode, Mode::FileRemote);
        assert_eq!(serde_json::to_string(&Mode::ArchiveTest).unwrap(), "\"archive_test\"");
    }

    #[test]
    fn test_modification_chars() {
        assert_eq!(Modification::from_char('c'), Modification::Saved);
        assert_eq!(Modification::from_char('r'), Modification::Removed);
        assert_eq!(Modification::from_char('l'), Modification::Launched);
        assert_eq!(Modification::from_char('f'), Modification::From);
        assert_eq!(Modification::from_char('t'), Modification::To);
        assert_eq!(Modification::from_char('a'), Modification::Added);
        assert_eq!(Modification::from_char('x'), Modification::Unknown);
        assert_eq!(Modification::from("cc".to_string()), Modification::Unknown);
    }

    #[test]
    fn test_file_json_keeps_payload() {
        let file = File::archive(SubmissionId::new(), 4, vec![0, 4, 255]);
        let json = serde_json::to_string(&file).unwrap();
        let back: File = serde_json::from_str(&json).unwrap();
        assert_eq!(back, file);
        assert!(json.contains("\"type\":\"archive\""));
    }

    #[test]
    fn test_id_display_parses_back() {
        let id = SubmissionId::new();
        let parsed: SubmissionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
