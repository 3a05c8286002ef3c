use super::ConfigError;
use core::ffi::CStr;

/// Runtime options, fixed at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Return null (and `EINVAL`/`ENOMEM`) instead of aborting on invalid
    /// alignment and calloc overflow. Exhausted memory always returns null.
    pub may_return_null: bool,
    /// Abort when a chunk is released through a different surface than the
    /// one that allocated it.
    pub dealloc_type_mismatch: bool,
    /// Abort when a sized deallocation names a different size.
    pub delete_size_mismatch: bool,
    /// Zero every allocation, not only calloc.
    pub zero_contents: bool,
    pub quarantine_size_kb: usize,
    pub quarantine_max_chunk_size: usize,
    /// Serve every Nth allocation from a guarded mapping. 0 disables.
    pub sampling_rate: usize,
    /// 0 off, 1 error ... 5 trace.
    pub log_level: usize,
}

impl Options {
    pub const DEFAULT: Options = Options {
        may_return_null: false,
        dealloc_type_mismatch: false,
        delete_size_mismatch: true,
        zero_contents: false,
        quarantine_size_kb: 0,
        quarantine_max_chunk_size: 2048,
        sampling_rate: 0,
        log_level: 0,
    };

    /// Apply `key=value` pairs from `input` on top of the current values.
    ///
    /// Pairs are separated by `:`, `,`, spaces, tabs or newlines. Returns the
    /// number of unrecognized keys; a malformed value is an error.
    pub fn parse(&mut self, input: &str) -> Result<usize, ConfigError> {
        let mut unrecognized = 0;
        let tokens = input
            .split(|c| matches!(c, ':' | ',' | ' ' | '\t' | '\n'))
            .filter(|token| !token.is_empty());
        for token in tokens {
            let (key, value) = token.split_once('=').ok_or(ConfigError::MissingValue)?;
            match OPTION_TABLE.iter().find(|(name, _)| *name == key) {
                Some(&(name, field)) => self.set(name, field, value)?,
                None => unrecognized += 1,
            }
        }
        Ok(unrecognized)
    }

    fn set(&mut self, name: &'static str, field: Field, value: &str) -> Result<(), ConfigError> {
        match field {
            Field::MayReturnNull => self.may_return_null = parse_bool(name, value)?,
            Field::DeallocTypeMismatch => self.dealloc_type_mismatch = parse_bool(name, value)?,
            Field::DeleteSizeMismatch => self.delete_size_mismatch = parse_bool(name, value)?,
            Field::ZeroContents => self.zero_contents = parse_bool(name, value)?,
            Field::QuarantineSizeKb => {
                let kb = parse_usize(name, value)?;
                if kb.checked_mul(1024).is_none() {
                    return Err(ConfigError::ValueOutOfRange { name });
                }
                self.quarantine_size_kb = kb;
            }
            Field::QuarantineMaxChunkSize => {
                self.quarantine_max_chunk_size = parse_usize(name, value)?
            }
            Field::SamplingRate => self.sampling_rate = parse_usize(name, value)?,
            Field::LogLevel => {
                let level = parse_usize(name, value)?;
                if level > 5 {
                    return Err(ConfigError::ValueOutOfRange { name });
                }
                self.log_level = level;
            }
        }
        Ok(())
    }

    pub fn quarantine_bytes(&self) -> usize {
        self.quarantine_size_kb * 1024
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy)]
enum Field {
    MayReturnNull,
    DeallocTypeMismatch,
    DeleteSizeMismatch,
    ZeroContents,
    QuarantineSizeKb,
    QuarantineMaxChunkSize,
    SamplingRate,
    LogLevel,
}

const OPTION_TABLE: &[(&str, Field)] = &[
    ("may_return_null", Field::MayReturnNull),
    ("dealloc_type_mismatch", Field::DeallocTypeMismatch),
    ("delete_size_mismatch", Field::DeleteSizeMismatch),
    ("zero_contents", Field::ZeroContents),
    ("quarantine_size_kb", Field::QuarantineSizeKb),
    ("quarantine_max_chunk_size", Field::QuarantineMaxChunkSize),
    ("sampling_rate", Field::SamplingRate),
    ("log_level", Field::LogLevel),
];

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::MalformedValue { name }),
    }
}

fn parse_usize(name: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::MalformedValue { name })
}

/// Read `HARDMALLOC_OPTIONS` without allocating.
///
/// # Safety
/// Calls `libc::getenv`. The returned slice borrows the environment block
/// and must be consumed before the environment is modified.
pub unsafe fn from_environment() -> Result<Option<&'static str>, ConfigError> {
    let raw = libc::getenv(b"HARDMALLOC_OPTIONS\0".as_ptr() as *const libc::c_char);
    if raw.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(raw)
        .to_str()
        .map(Some)
        .map_err(|_| ConfigError::NotUtf8)
}
