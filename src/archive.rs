use anyhow::{anyhow, Context, Result};
use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

/// Progress hook used by multi-entry operations: `(total, current) -> keep going`.
pub type ProgressFn<'a> = dyn FnMut(u64, u64) -> bool + 'a;

enum Mode {
    Read(ZipArchive<File>),
    Write {
        writer: ZipWriter<File>,
        options: SimpleFileOptions,
        count: usize,
    },
    Closed,
}

/// Narrow container interface used for mod sources and backups.
pub struct Archive {
    path: PathBuf,
    mode: Mode,
    last_error: String,
}

pub fn compression_for(method: i32) -> CompressionMethod {
    match method {
        0 => CompressionMethod::Stored,
        12 => CompressionMethod::Bzip2,
        93 => CompressionMethod::Zstd,
        _ => CompressionMethod::Deflated,
    }
}

impl Archive {
    pub fn open_for_read(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open archive {path:?}"))?;
        let archive = ZipArchive::new(file).with_context(|| format!("read archive {path:?}"))?;
        Ok(Self {
            path: path.to_path_buf(),
            mode: Mode::Read(archive),
            last_error: String::new(),
        })
    }

    pub fn open_for_write(path: &Path, method: i32, level: i32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create archive dir")?;
        }
        let file = File::create(path).with_context(|| format!("create archive {path:?}"))?;
        let compression = compression_for(method);
        let level = match compression {
            CompressionMethod::Stored => None,
            _ => Some(i64::from(level)),
        };
        let options = SimpleFileOptions::default()
            .compression_method(compression)
            .compression_level(level)
            .large_file(true);
        Ok(Self {
            path: path.to_path_buf(),
            mode: Mode::Write {
                writer: ZipWriter::new(file),
                options,
                count: 0,
            },
            last_error: String::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn entry_count(&self) -> usize {
        match &self.mode {
            Mode::Read(archive) => archive.len(),
            Mode::Write { count, .. } => *count,
            Mode::Closed => 0,
        }
    }

    fn reader(&mut self) -> Result<&mut ZipArchive<File>> {
        match &mut self.mode {
            Mode::Read(archive) => Ok(archive),
            _ => Err(anyhow!("archive {:?} is not open for reading", self.path)),
        }
    }

    pub fn entry_path(&mut self, index: usize) -> Result<String> {
        let archive = self.reader()?;
        let file = archive.by_index_raw(index).context("archive entry")?;
        Ok(file.name().trim_end_matches('/').to_string())
    }

    pub fn entry_size(&mut self, index: usize) -> Result<u64> {
        let archive = self.reader()?;
        let file = archive.by_index_raw(index).context("archive entry")?;
        Ok(file.size())
    }

    pub fn entry_is_dir(&mut self, index: usize) -> Result<bool> {
        let archive = self.reader()?;
        let file = archive.by_index_raw(index).context("archive entry")?;
        Ok(file.is_dir())
    }

    pub fn locate_entry(&mut self, name: &str) -> Option<usize> {
        let archive = self.reader().ok()?;
        archive
            .index_for_name(name)
            .or_else(|| archive.index_for_name(&format!("{name}/")))
    }

    /// Walks the central directory from the last entry backward; definition
    /// files are conventionally appended last.
    pub fn rlocate_entry(&mut self, name: &str) -> Option<usize> {
        let count = self.entry_count();
        for index in (0..count).rev() {
            let Ok(path) = self.entry_path(index) else {
                continue;
            };
            if path.eq_ignore_ascii_case(name) {
                return Some(index);
            }
        }
        None
    }

    pub fn extract_to_file(&mut self, index: usize, dest: &Path) -> Result<()> {
        let result = self.extract_to_file_inner(index, dest);
        self.note(result)
    }

    fn extract_to_file_inner(&mut self, index: usize, dest: &Path) -> Result<()> {
        let archive = self.reader()?;
        let mut file = archive.by_index(index).context("archive entry")?;
        if file.is_dir() {
            fs::create_dir_all(dest).with_context(|| format!("create dir {dest:?}"))?;
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
        }
        let mut out = File::create(dest).with_context(|| format!("create file {dest:?}"))?;
        io::copy(&mut file, &mut out).with_context(|| format!("extract to {dest:?}"))?;
        Ok(())
    }

    pub fn extract_to_memory(&mut self, index: usize) -> Result<Vec<u8>> {
        let result = (|| -> Result<Vec<u8>> {
            let archive = self.reader()?;
            let mut file = archive.by_index(index).context("archive entry")?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data).context("read archive entry")?;
            Ok(data)
        })();
        self.note(result)
    }

    pub fn add_from_file(&mut self, source: &Path, name: &str) -> Result<()> {
        let result = (|| -> Result<()> {
            let mut input =
                File::open(source).with_context(|| format!("open {source:?} for archiving"))?;
            self.start_entry(name)?;
            let writer = self.writer()?;
            io::copy(&mut input, writer).with_context(|| format!("archive {source:?}"))?;
            Ok(())
        })();
        self.note(result)
    }

    pub fn add_from_memory(&mut self, data: &[u8], name: &str) -> Result<()> {
        let result = (|| -> Result<()> {
            self.start_entry(name)?;
            let writer = self.writer()?;
            writer.write_all(data).context("write archive entry")?;
            Ok(())
        })();
        self.note(result)
    }

    pub fn add_directory(&mut self, name: &str) -> Result<()> {
        let result = match &mut self.mode {
            Mode::Write {
                writer,
                options,
                count,
            } => {
                *count += 1;
                writer
                    .add_directory(name, *options)
                    .with_context(|| format!("add directory {name}"))
            }
            _ => Err(anyhow!("archive {:?} is not open for writing", self.path)),
        };
        self.note(result)
    }

    fn start_entry(&mut self, name: &str) -> Result<()> {
        match &mut self.mode {
            Mode::Write {
                writer,
                options,
                count,
            } => {
                writer
                    .start_file(name, *options)
                    .with_context(|| format!("start entry {name}"))?;
                *count += 1;
                Ok(())
            }
            _ => Err(anyhow!("archive {:?} is not open for writing", self.path)),
        }
    }

    fn writer(&mut self) -> Result<&mut ZipWriter<File>> {
        match &mut self.mode {
            Mode::Write { writer, .. } => Ok(writer),
            _ => Err(anyhow!("archive {:?} is not open for writing", self.path)),
        }
    }

    /// Finalizes a written archive. Reading handles just drop.
    pub fn close(&mut self) -> Result<()> {
        let mode = std::mem::replace(&mut self.mode, Mode::Closed);
        let result = match mode {
            Mode::Write { writer, .. } => writer
                .finish()
                .map(|_| ())
                .with_context(|| format!("finalize archive {:?}", self.path)),
            _ => Ok(()),
        };
        self.note(result)
    }

    fn note<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.last_error = crate::error::summarize(err);
        }
        result
    }
}
