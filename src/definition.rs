use crate::{
    entry::{normalize_path, Entry, EntryManifest},
    error::ModError,
};
use anyhow::{Context, Result};
use quick_xml::{
    events::{BytesDecl, BytesStart, BytesText, Event},
    Reader, Writer,
};
use std::io::Cursor;

pub const SOURCE_DEFINITION_FILE: &str = "modvault.xml";
pub const BACKUP_DEFINITION_FILE: &str = "backup.xml";
pub const DEFINITION_VERSION: &str = "1";

const SOURCE_ROOT: &str = "mod_definition";
const BACKUP_ROOT: &str = "backup_definition";

/// Optional manifest shipped inside a mod source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDefinition {
    pub install: String,
    pub dependencies: Vec<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub picture: Option<String>,
}

/// Mandatory manifest of a backup: what was saved and what was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupDefinition {
    pub ident: String,
    pub hash: u64,
    pub backup_root: String,
    /// `<cpy>` entries followed by `<del>` entries, as one manifest.
    pub entries: EntryManifest,
    pub overlaps: Vec<u64>,
}

pub fn parse_source_definition(xml: &str) -> Result<SourceDefinition> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut stack: Vec<String> = Vec::new();
    let mut def = SourceDefinition::default();
    let mut has_install = false;
    let mut seen_root = false;

    loop {
        match reader.read_event().context("read mod definition")? {
            Event::Start(e) => {
                let name = tag_name(&e);
                if stack.is_empty() {
                    check_root(&name, SOURCE_ROOT)?;
                    seen_root = true;
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                if stack.is_empty() {
                    check_root(&tag_name(&e), SOURCE_ROOT)?;
                    seen_root = true;
                }
            }
            Event::Text(text) => {
                let value = text.unescape().context("decode mod definition text")?;
                let path: Vec<&str> = stack.iter().map(String::as_str).collect();
                match path.as_slice() {
                    [_, "install"] => {
                        def.install = normalize_path(&value);
                        has_install = true;
                    }
                    [_, "dependencies", "ident"] => {
                        let ident = value.trim();
                        if !ident.is_empty() {
                            def.dependencies.push(ident.to_string());
                        }
                    }
                    [_, "category"] => def.category = Some(value.trim().to_string()),
                    [_, "description"] => def.description = Some(normalize_crlf(&value)),
                    [_, "picture"] => def.picture = Some(normalize_path(&value)),
                    _ => {}
                }
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(ModError::Definition("empty mod definition".to_string()).into());
    }
    if !has_install {
        return Err(ModError::MissingField("install").into());
    }
    Ok(def)
}

pub fn write_source_definition(def: &SourceDefinition) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer
        .create_element(SOURCE_ROOT)
        .with_attribute(("version", DEFINITION_VERSION))
        .write_inner_content(|w| {
            w.create_element("install")
                .write_text_content(BytesText::new(&def.install))?;
            if !def.dependencies.is_empty() {
                w.create_element("dependencies").write_inner_content(|w| {
                    for ident in &def.dependencies {
                        w.create_element("ident")
                            .write_text_content(BytesText::new(ident))?;
                    }
                    Ok::<(), quick_xml::Error>(())
                })?;
            }
            if let Some(category) = &def.category {
                w.create_element("category")
                    .write_text_content(BytesText::new(category))?;
            }
            if let Some(description) = &def.description {
                w.create_element("description")
                    .write_text_content(BytesText::new(description))?;
            }
            if let Some(picture) = &def.picture {
                w.create_element("picture")
                    .write_text_content(BytesText::new(picture))?;
            }
            Ok::<(), quick_xml::Error>(())
        })
        .context("serialize mod definition")?;
    Ok(writer.into_inner().into_inner())
}

pub fn parse_backup_definition(xml: &str) -> Result<BackupDefinition> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut stack: Vec<String> = Vec::new();
    let mut ident: Option<String> = None;
    let mut hash: Option<u64> = None;
    let mut backup_root: Option<String> = None;
    let mut copies = Vec::new();
    let mut deletions = Vec::new();
    let mut overlaps = Vec::new();
    let mut pending_attrs: Option<(i64, bool)> = None;
    let mut seen_root = false;

    loop {
        match reader.read_event().context("read backup definition")? {
            Event::Start(e) => {
                let name = tag_name(&e);
                if stack.is_empty() {
                    check_root(&name, BACKUP_ROOT)?;
                    seen_root = true;
                }
                if stack.len() == 1 && (name == "cpy" || name == "del") {
                    let cdi = attr_value(&e, b"cdi")
                        .and_then(|value| value.trim().parse::<i64>().ok())
                        .unwrap_or(-1);
                    let dir = attr_value(&e, b"dir").is_some_and(|value| value.trim() == "1");
                    pending_attrs = Some((cdi, dir));
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                if stack.is_empty() {
                    check_root(&tag_name(&e), BACKUP_ROOT)?;
                    seen_root = true;
                }
            }
            Event::Text(text) => {
                let value = text.unescape().context("decode backup definition text")?;
                let path: Vec<&str> = stack.iter().map(String::as_str).collect();
                match path.as_slice() {
                    [_, "ident"] => ident = Some(value.trim().to_string()),
                    [_, "hash"] => {
                        let parsed = value.trim().parse::<u64>().map_err(|_| {
                            ModError::Definition(format!("invalid hash '{}'", value.trim()))
                        })?;
                        hash = Some(parsed);
                    }
                    [_, "backup"] => backup_root = Some(normalize_path(&value)),
                    [_, kind @ ("cpy" | "del")] => {
                        let (cdi, dir) = pending_attrs.take().unwrap_or((-1, false));
                        let path = normalize_path(&value);
                        if path.is_empty() {
                            continue;
                        }
                        let entry = Entry {
                            path,
                            is_dir: dir,
                            delete_marker: *kind == "del",
                            archive_index: if *kind == "del" { -1 } else { cdi },
                        };
                        if *kind == "del" {
                            deletions.push(entry);
                        } else {
                            copies.push(entry);
                        }
                    }
                    [_, "overlap", "hash"] => {
                        if let Ok(parsed) = value.trim().parse::<u64>() {
                            overlaps.push(parsed);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                stack.pop();
                if stack.len() == 1 {
                    pending_attrs = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(ModError::Definition("empty backup definition".to_string()).into());
    }
    let ident = ident
        .filter(|value| !value.is_empty())
        .ok_or(ModError::MissingField("ident"))?;
    let hash = hash.ok_or(ModError::MissingField("hash"))?;
    let backup_root = backup_root.ok_or(ModError::MissingField("backup"))?;

    let mut entries = EntryManifest::new();
    for entry in copies {
        entries.push_unique(entry);
    }
    // Copy and delete lists share the relative path space; keep both sides.
    let mut merged: Vec<Entry> = entries.iter().cloned().collect();
    for entry in deletions {
        if !merged
            .iter()
            .any(|existing| existing.delete_marker && existing.path == entry.path)
        {
            merged.push(entry);
        }
    }

    Ok(BackupDefinition {
        ident,
        hash,
        backup_root,
        entries: EntryManifest::from_entries(merged),
        overlaps,
    })
}

pub fn write_backup_definition(def: &BackupDefinition) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer
        .create_element(BACKUP_ROOT)
        .with_attribute(("version", DEFINITION_VERSION))
        .write_inner_content(|w| {
            w.create_element("ident")
                .write_text_content(BytesText::new(&def.ident))?;
            w.create_element("hash")
                .write_text_content(BytesText::new(&def.hash.to_string()))?;
            w.create_element("backup")
                .write_text_content(BytesText::new(&def.backup_root))?;
            for entry in def.entries.copies() {
                let cdi = entry.archive_index.to_string();
                w.create_element("cpy")
                    .with_attribute(("cdi", cdi.as_str()))
                    .with_attribute(("dir", if entry.is_dir { "1" } else { "0" }))
                    .write_text_content(BytesText::new(&entry.path))?;
            }
            for entry in def.entries.deletions() {
                w.create_element("del")
                    .with_attribute(("dir", if entry.is_dir { "1" } else { "0" }))
                    .write_text_content(BytesText::new(&entry.path))?;
            }
            if !def.overlaps.is_empty() {
                w.create_element("overlap").write_inner_content(|w| {
                    for hash in &def.overlaps {
                        w.create_element("hash")
                            .write_text_content(BytesText::new(&hash.to_string()))?;
                    }
                    Ok::<(), quick_xml::Error>(())
                })?;
            }
            Ok::<(), quick_xml::Error>(())
        })
        .context("serialize backup definition")?;
    Ok(writer.into_inner().into_inner())
}

fn check_root(name: &str, expected: &str) -> Result<()> {
    if name == expected {
        Ok(())
    } else {
        Err(ModError::Definition(format!("unexpected root <{name}>, wanted <{expected}>")).into())
    }
}

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == key {
            if let Ok(value) = attr.unescape_value() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Normalizes line endings to CRLF.
pub fn normalize_crlf(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\n', "\r\n")
}
