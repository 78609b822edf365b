use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use oxc3::{
    Archive, CACompressionType, CAEncryptionType, CAFile, CASettings, DLCompressionType, DLEncryptionType, DLEntries,
    DLFile, DLSettings, EncryptionKey, OxError,
};

#[derive(Parser)]
#[command(name = "oxc3", version = "1.0.0", about = "The OxC3 container format CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 64 hex characters (32 bytes): AES-256-GCM key
    #[arg(long, global = true)]
    aes: Option<String>,

    /// Hash with SHA-256 instead of CRC32C
    #[arg(long, global = true)]
    sha256: bool,

    /// Store DOS dates on oiCA files
    #[arg(long, global = true)]
    date: bool,

    /// Store full (nanosecond) timestamps on oiCA files
    #[arg(long, global = true)]
    full_date: bool,

    /// Treat oiDL string entries as ASCII
    #[arg(long, global = true)]
    ascii: bool,

    /// Treat oiDL string entries as UTF-8
    #[arg(long, global = true)]
    utf8: bool,

    /// Split a single input file into oiDL entries on this delimiter
    #[arg(long = "split-by", global = true)]
    split_by: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a directory into an oiCA archive
    Pack {
        #[arg(long = "input")]
        input: PathBuf,
        #[arg(long = "output")]
        output: PathBuf,
    },
    /// Unpack an oiCA archive into a directory
    Unpack {
        #[arg(long = "input")]
        input: PathBuf,
        #[arg(long = "output")]
        output: PathBuf,
    },
    /// List the entries of an oiCA archive or an oiDL list
    List {
        #[arg(long = "input")]
        input: PathBuf,
    },
    /// Build an oiDL list from one or more input files (one entry per file),
    /// or from a single file split by `--split-by`
    DlPack {
        #[arg(long = "input", num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(long = "output")]
        output: PathBuf,
    },
    /// Extract a single entry (or a byte range of it) from an oiDL list
    DlEntry {
        #[arg(long = "input")]
        input: PathBuf,
        #[arg(long = "output")]
        output: PathBuf,
        #[arg(long = "entry")]
        entry: String,
        #[arg(long = "start")]
        start: Option<u64>,
        #[arg(long = "length")]
        length: Option<u64>,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn parse_key(aes: &Option<String>) -> Result<Option<[u8; 32]>, OxError> {
    match aes {
        None => Ok(None),
        Some(hex_str) => {
            let bytes = hex::decode(hex_str)
                .map_err(|e| OxError::InvalidParameter(format!("--aes is not valid hex: {e}")))?;
            let key = EncryptionKey::from_slice(&bytes)?;
            Ok(Some(*key.as_bytes()))
        }
    }
}

fn run(cli: Cli) -> Result<(), OxError> {
    let key = parse_key(&cli.aes)?;

    match cli.command {
        Commands::Pack { input, output } => {
            let archive = archive_from_directory(&input)?;
            let settings = CASettings {
                compression: CACompressionType::None,
                encryption: if key.is_some() { CAEncryptionType::Aes256Gcm } else { CAEncryptionType::None },
                include_date: cli.date,
                include_full_date: cli.full_date,
                use_sha256: cli.sha256,
                key,
            };
            let ca = CAFile { settings, archive };
            let bytes = ca.write()?;
            std::fs::write(&output, bytes).map_err(OxError::Io)?;
            println!("packed {} -> {}", input.display(), output.display());
        }

        Commands::Unpack { input, output } => {
            let buf = std::fs::read(&input).map_err(OxError::Io)?;
            let ca = CAFile::read(&buf, key.as_ref())?;
            for entry in ca.archive.canonical_order() {
                let dest = output.join(&entry.path);
                match entry.kind {
                    oxc3::EntryKind::Folder => std::fs::create_dir_all(&dest).map_err(OxError::Io)?,
                    oxc3::EntryKind::File => {
                        if let Some(parent) = dest.parent() {
                            std::fs::create_dir_all(parent).map_err(OxError::Io)?;
                        }
                        std::fs::write(&dest, &entry.data).map_err(OxError::Io)?;
                    }
                }
            }
            println!("unpacked {} -> {}", input.display(), output.display());
        }

        Commands::List { input } => {
            let buf = std::fs::read(&input).map_err(OxError::Io)?;
            if let Ok(ca) = CAFile::read(&buf, key.as_ref()) {
                for entry in ca.archive.canonical_order() {
                    println!("{:>10}  {}", entry.data.len(), entry.path);
                }
            } else {
                let dl = DLFile::read(&buf, key.as_ref(), false)?;
                match &dl.entries {
                    DLEntries::Ascii(v) | DLEntries::Utf8(v) => {
                        for (i, s) in v.iter().enumerate() {
                            println!("[{i}] {s}");
                        }
                    }
                    DLEntries::Data(v) => {
                        for (i, b) in v.iter().enumerate() {
                            println!("[{i}] {} bytes", b.len());
                        }
                    }
                }
            }
        }

        Commands::DlPack { input, output } => {
            let settings = DLSettings {
                compression: DLCompressionType::None,
                encryption: if key.is_some() { DLEncryptionType::Aes256Gcm } else { DLEncryptionType::None },
                use_sha256: cli.sha256,
                data_type: if cli.utf8 {
                    oxc3::DataType::Utf8
                } else if cli.ascii {
                    oxc3::DataType::Ascii
                } else {
                    oxc3::DataType::Data
                },
                key,
            };

            let entries = if let (Some(delim), Some(path)) = (&cli.split_by, input.first()) {
                let text = std::fs::read_to_string(path).map_err(OxError::Io)?;
                let parts = text.split(delim.as_str()).map(|s| s.to_string()).collect();
                if cli.utf8 {
                    DLEntries::Utf8(parts)
                } else {
                    DLEntries::Ascii(parts)
                }
            } else if cli.ascii || cli.utf8 {
                let mut strings = Vec::with_capacity(input.len());
                for path in &input {
                    strings.push(std::fs::read_to_string(path).map_err(OxError::Io)?);
                }
                if cli.utf8 {
                    DLEntries::Utf8(strings)
                } else {
                    DLEntries::Ascii(strings)
                }
            } else {
                let mut blobs = Vec::with_capacity(input.len());
                for path in &input {
                    blobs.push(std::fs::read(path).map_err(OxError::Io)?);
                }
                DLEntries::Data(blobs)
            };

            let dl = DLFile::new(settings, entries);
            let bytes = dl.write(false)?;
            std::fs::write(&output, bytes).map_err(OxError::Io)?;
            println!("packed {} entries -> {}", dl.entry_count(), output.display());
        }

        Commands::DlEntry { input, output, entry, start, length } => {
            let buf = std::fs::read(&input).map_err(OxError::Io)?;
            let dl = DLFile::read(&buf, key.as_ref(), false)?;
            let index = entry
                .parse::<usize>()
                .ok()
                .or_else(|| dl.find(&entry))
                .ok_or_else(|| OxError::NotFound(format!("no such entry {entry}")))?;
            let data: Vec<u8> = match &dl.entries {
                DLEntries::Data(v) => v
                    .get(index)
                    .cloned()
                    .ok_or_else(|| OxError::OutOfBounds(format!("entry index {index} out of range")))?,
                DLEntries::Ascii(v) | DLEntries::Utf8(v) => v
                    .get(index)
                    .map(|s| s.as_bytes().to_vec())
                    .ok_or_else(|| OxError::OutOfBounds(format!("entry index {index} out of range")))?,
            };
            let data = &data;

            let start = start.unwrap_or(0) as usize;
            let length = length.map(|l| l as usize).unwrap_or(data.len().saturating_sub(start));
            let end = start
                .checked_add(length)
                .filter(|&e| e <= data.len())
                .ok_or_else(|| OxError::OutOfBounds("requested range exceeds entry length".into()))?;

            std::fs::write(&output, &data[start..end]).map_err(OxError::Io)?;
            println!("extracted entry {index} [{start}..{end}) -> {}", output.display());
        }
    }

    Ok(())
}

fn archive_from_directory(root: &Path) -> Result<Archive, OxError> {
    let mut archive = Archive::new();
    visit_directory(root, Path::new(""), &mut archive)?;
    Ok(archive)
}

fn visit_directory(disk_dir: &Path, archive_prefix: &Path, archive: &mut Archive) -> Result<(), OxError> {
    let mut read_dir: Vec<_> = std::fs::read_dir(disk_dir).map_err(OxError::Io)?.collect::<std::io::Result<_>>().map_err(OxError::Io)?;
    read_dir.sort_by_key(|e| e.file_name());

    for entry in read_dir {
        let name = entry.file_name().to_string_lossy().into_owned();
        let archive_path = archive_prefix.join(&name);
        let archive_path_str = archive_path.to_string_lossy().replace('\\', "/");
        let file_type = entry.file_type().map_err(OxError::Io)?;

        if file_type.is_dir() {
            archive.add_directory(&archive_path_str)?;
            visit_directory(&entry.path(), &archive_path, archive)?;
        } else if file_type.is_file() {
            let data = std::fs::read(entry.path()).map_err(OxError::Io)?;
            let timestamp = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            archive.add_file(&archive_path_str, data, timestamp)?;
        }
    }
    Ok(())
}
