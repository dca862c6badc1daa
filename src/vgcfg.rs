//! LVM volume group metadata, as written by `vgcfgbackup`.
//!
//! The text format is a tree of `name { ... }` groups holding
//! `name = value` assignments, where a value is a string, an integer
//! or a `[ ... ]` list of those. `#` starts a comment.

use std::{
    collections::BTreeMap,
    iter::Peekable,
    str::CharIndices,
};

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    Integer(i64),
    String(String),
    List(Vec<Value>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Group {
    pub name: String,
    values: BTreeMap<String, Value>,
    groups: BTreeMap<String, Group>,
}

impl Group {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.value(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.value(key) {
            Some(Value::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    fn segment_type(&self) -> Option<&str> {
        self.group("segment1").and_then(|s| s.string("type"))
    }

    fn is_thin_pool(&self) -> bool {
        self.segment_type() == Some("thin-pool")
    }

    fn is_thin_volume(&self) -> bool {
        self.segment_type() == Some("thin")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ThinPoolInfo {
    pub name: String,
    pub uuid: String,
    pub metadata_lv: String,
    pub data_lv: String,
    /// Allocation granularity in bytes.
    pub chunk_size: u64,
    pub extent_count: u64,
    pub zero_new_blocks: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ThinLvInfo {
    pub name: String,
    pub uuid: String,
    pub pool: String,
    pub origin: Option<String>,
    pub transaction_id: u64,
    /// Device id of the volume inside the pool's metadata.
    pub device_id: u64,
    pub extent_count: u64,
}

fn missing(lv: &Group, field: &str) -> Error {
    Error::ConfigLookup(format!("{}: missing or invalid {}", lv.name, field))
}

fn unsigned(segment: &Group, lv: &Group, key: &str) -> Result<u64> {
    segment
        .integer(key)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| missing(lv, key))
}

impl ThinPoolInfo {
    fn from_group(lv: &Group) -> Result<Self> {
        let segment = lv.group("segment1").ok_or_else(|| missing(lv, "segment1"))?;
        Ok(Self {
            name: lv.name.clone(),
            uuid: lv.string("id").ok_or_else(|| missing(lv, "id"))?.to_string(),
            metadata_lv: segment
                .string("metadata")
                .ok_or_else(|| missing(lv, "metadata"))?
                .to_string(),
            data_lv: segment
                .string("pool")
                .ok_or_else(|| missing(lv, "pool"))?
                .to_string(),
            chunk_size: unsigned(segment, lv, "chunk_size")? * 512,
            extent_count: unsigned(segment, lv, "extent_count")?,
            zero_new_blocks: segment.integer("zero_new_blocks").unwrap_or(0) != 0,
        })
    }
}

impl ThinLvInfo {
    fn from_group(lv: &Group) -> Result<Self> {
        let segment = lv.group("segment1").ok_or_else(|| missing(lv, "segment1"))?;
        Ok(Self {
            name: lv.name.clone(),
            uuid: lv.string("id").ok_or_else(|| missing(lv, "id"))?.to_string(),
            pool: segment
                .string("thin_pool")
                .ok_or_else(|| missing(lv, "thin_pool"))?
                .to_string(),
            origin: segment.string("origin").map(str::to_string),
            transaction_id: unsigned(segment, lv, "transaction_id")?,
            device_id: unsigned(segment, lv, "device_id")?,
            extent_count: unsigned(segment, lv, "extent_count")?,
        })
    }
}

/// Parsed metadata of one volume group.
#[derive(Debug, Clone)]
pub(crate) struct VgConfig {
    root: Group,
}

impl VgConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parser = Parser::new(text);
        let root = parser.config()?;
        Ok(Self { root })
    }

    /// The single volume group described by the file.
    fn volume_group(&self) -> Result<&Group> {
        let mut groups = self.root.groups();
        match (groups.next(), groups.next()) {
            (Some(vg), None) => Ok(vg),
            _ => Err(Error::ConfigLookup(
                "config must describe exactly one volume group".into(),
            )),
        }
    }

    pub fn vg_name(&self) -> Result<&str> {
        Ok(&self.volume_group()?.name)
    }

    /// Physical extent size in bytes.
    pub fn extent_size(&self) -> Result<u64> {
        let vg = self.volume_group()?;
        vg.integer("extent_size")
            .and_then(|v| u64::try_from(v).ok())
            .map(|v| v * 512)
            .ok_or_else(|| missing(vg, "extent_size"))
    }

    fn logical_volumes(&self) -> Result<impl Iterator<Item = &Group>> {
        let vg = self.volume_group()?;
        let lvs = vg
            .group("logical_volumes")
            .ok_or_else(|| missing(vg, "logical_volumes"))?;
        Ok(lvs.groups())
    }

    /// Whether any logical volume, thin or not, is called `name`.
    pub fn has_volume(&self, name: &str) -> Result<bool> {
        Ok(self.logical_volumes()?.any(|lv| lv.name == name))
    }

    /// Only the named volume has to be complete.
    pub fn find_thin_pool(&self, name: &str) -> Result<ThinPoolInfo> {
        self.logical_volumes()?
            .find(|lv| lv.name == name && lv.is_thin_pool())
            .ok_or_else(|| Error::ConfigLookup(format!("can not find thin pool {name}")))
            .and_then(ThinPoolInfo::from_group)
    }

    pub fn find_thin_volume(&self, name: &str) -> Result<ThinLvInfo> {
        self.logical_volumes()?
            .find(|lv| lv.name == name && lv.is_thin_volume())
            .ok_or_else(|| Error::ConfigLookup(format!("can not find thin volume {name}")))
            .and_then(ThinLvInfo::from_group)
    }

    /// Size of a volume in bytes.
    pub fn volume_size(&self, lv: &ThinLvInfo) -> Result<u64> {
        Ok(lv.extent_count * self.extent_size()?)
    }
}

struct Parser<'a> {
    text: &'a str,
    chars: Peekable<CharIndices<'a>>,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            chars: text.char_indices().peekable(),
            line: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::ConfigSyntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let (_, c) = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    /// Skips whitespace and comments.
    fn skip_space(&mut self) {
        while let Some(c) = self.peek() {
            if c == '#' {
                while !matches!(self.peek(), None | Some('\n')) {
                    self.bump();
                }
            } else if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, wanted: char) -> Result<()> {
        self.skip_space();
        match self.bump() {
            Some(c) if c == wanted => Ok(()),
            Some(c) => Err(self.error(format!("expected '{wanted}', found '{c}'"))),
            None => Err(self.error(format!("expected '{wanted}', found end of input"))),
        }
    }

    fn config(&mut self) -> Result<Group> {
        let mut root = Group::new("");
        self.items(&mut root)?;
        self.skip_space();
        match self.peek() {
            None => Ok(root),
            Some(c) => Err(self.error(format!("unexpected '{c}'"))),
        }
    }

    /// Assignments and subgroups until end of input or a closing brace.
    fn items(&mut self, group: &mut Group) -> Result<()> {
        loop {
            self.skip_space();
            match self.peek() {
                None | Some('}') => return Ok(()),
                Some(_) => {}
            }
            let name = self.name()?;
            self.skip_space();
            match self.bump() {
                Some('=') => {
                    let value = self.value()?;
                    group.values.insert(name, value);
                }
                Some('{') => {
                    let mut sub = Group::new(&name);
                    self.items(&mut sub)?;
                    self.expect('}')?;
                    group.groups.insert(name, sub);
                }
                Some(c) => return Err(self.error(format!("expected '=' or '{{' after {name}, found '{c}'"))),
                None => return Err(self.error(format!("unexpected end of input after {name}"))),
            }
        }
    }

    fn name(&mut self) -> Result<String> {
        let start = match self.chars.peek().copied() {
            Some((i, c)) if is_name_char(c) => i,
            Some((_, c)) => return Err(self.error(format!("expected a name, found '{c}'"))),
            None => return Err(self.error("expected a name")),
        };
        let mut end = start;
        while let Some((i, c)) = self.chars.peek().copied() {
            if !is_name_char(c) {
                break;
            }
            end = i + c.len_utf8();
            self.bump();
        }
        Ok(self.text[start..end].to_string())
    }

    fn value(&mut self) -> Result<Value> {
        self.skip_space();
        match self.peek() {
            Some('"') => self.string().map(Value::String),
            Some('[') => self.list(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.integer(),
            Some(c) => Err(self.error(format!("expected a value, found '{c}'"))),
            None => Err(self.error("expected a value, found end of input")),
        }
    }

    fn string(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut s = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(s),
                Some('\\') => match self.bump() {
                    Some(c) => s.push(c),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => s.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn integer(&mut self) -> Result<Value> {
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if c == '-' || c.is_ascii_alphanumeric() {
                digits.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let (negative, body) = match digits.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, digits.as_str()),
        };
        let parsed = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
            Some(hex) => i64::from_str_radix(hex, 16),
            None => body.parse::<i64>(),
        };
        match parsed {
            Ok(v) if negative => Ok(Value::Integer(-v)),
            Ok(v) => Ok(Value::Integer(v)),
            Err(e) => Err(self.error(format!("can not parse integer {digits:?}: {e}"))),
        }
    }

    fn list(&mut self) -> Result<Value> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_space();
            match self.peek() {
                Some(']') => {
                    self.bump();
                    return Ok(Value::List(items));
                }
                Some(',') if !items.is_empty() => {
                    self.bump();
                }
                _ => items.push(self.value()?),
            }
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '+' | '-')
}
