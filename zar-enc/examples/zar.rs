//! Pack a directory into a zar archive, or extract an archive back into a
//! directory tree. The mode is picked from the input path: a directory packs,
//! a regular file extracts.

use std::{
    borrow::Cow,
    fs,
    io::{BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use zar::{Archive, NodeHandle};
use zar_enc::Writer;

#[derive(Debug, clap::Parser)]
#[command(version, about)]
struct Cli {
    /// A directory to pack, or a zar archive to extract.
    input: PathBuf,

    /// Output archive path when packing, output directory when extracting.
    ///
    /// Defaults to `<input stem>.zar` respectively `<input stem>_extracted/`
    /// next to the input.
    output: Option<PathBuf>,
}

fn main() {
    let cli: Cli = clap::Parser::parse();
    std::process::exit(run(&cli));
}

fn run(cli: &Cli) -> i32 {
    if cli.input.is_file() {
        let output = cli.output.clone().unwrap_or_else(|| {
            let out = sibling_path(&cli.input, "_extracted");
            eprintln!("extracting to: {}", out.display());
            out
        });
        if output.exists() && !output.is_dir() {
            eprintln!("the output path is not a valid directory");
            return -3;
        }
        if fs::create_dir_all(&output).is_err() {
            eprintln!("failed to create the output directory");
            return -4;
        }
        extract(&cli.input, &output)
    } else if cli.input.is_dir() {
        let output = cli.output.clone().unwrap_or_else(|| {
            let out = sibling_path(&cli.input, ".zar");
            eprintln!("packing to: {}", out.display());
            out
        });
        if output.exists() {
            if !output.is_file() {
                eprintln!("the output path is not a valid file");
                return -10;
            }
            eprintln!("the output file already exists");
            return -11;
        }
        let code = pack(&cli.input, &output);
        if code != 0 {
            // Drop the incomplete output.
            let _ = fs::remove_file(&output);
        }
        code
    } else {
        eprintln!("input path is not a valid file or directory");
        -1
    }
}

fn sibling_path(input: &Path, suffix: &str) -> PathBuf {
    let mut name = input.file_stem().unwrap_or_default().to_os_string();
    name.push(suffix);
    input.with_file_name(name)
}

fn pack(input_dir: &Path, output: &Path) -> i32 {
    let fout = match fs::File::create(output) {
        Ok(f) => f,
        Err(err) => {
            eprintln!("failed to create output file: {err}");
            return -16;
        }
    };
    let mut writer = match Writer::new(BufWriter::new(fout)) {
        Ok(w) => w,
        Err(err) => {
            eprintln!("failed to start archive: {err}");
            return -16;
        }
    };

    let mut buf = vec![0u8; 64 * 1024];
    let mut stack = Vec::new();
    match fs::read_dir(input_dir) {
        Ok(iter) => stack.push((String::new(), iter)),
        Err(err) => {
            eprintln!("failed to read input directory: {err}");
            return -15;
        }
    }

    while let Some((prefix, iter)) = stack.last_mut() {
        let ent = match iter.next() {
            Some(Ok(ent)) => ent,
            Some(Err(err)) => {
                eprintln!("failed to read input directory: {err}");
                return -15;
            }
            None => {
                stack.pop();
                continue;
            }
        };

        let name = ent.file_name();
        let name_str = name.to_string_lossy();
        if matches!(name_str, Cow::Owned(_)) {
            eprintln!("normalized non-UTF-8 name: {name:?} -> {name_str:?}");
        }
        let rel = if prefix.is_empty() {
            name_str.into_owned()
        } else {
            format!("{prefix}/{name_str}")
        };

        let ft = match ent.file_type() {
            Ok(ft) => ft,
            Err(err) => {
                eprintln!("failed to stat {rel}: {err}");
                return -15;
            }
        };
        if ft.is_dir() {
            if writer.make_dir(&rel, false).is_err() {
                eprintln!("failed to create directory {rel}");
                return -13;
            }
            match fs::read_dir(ent.path()) {
                Ok(iter) => stack.push((rel, iter)),
                Err(err) => {
                    eprintln!("failed to read directory {rel}: {err}");
                    return -15;
                }
            }
        } else if ft.is_file() {
            println!("adding {rel}");
            if writer.start_file(&rel).is_err() {
                eprintln!("failed to create archive file {rel}");
                return -14;
            }
            let mut fin = match fs::File::open(ent.path()) {
                Ok(f) => f,
                Err(err) => {
                    eprintln!("failed to open input file {rel}: {err}");
                    return -15;
                }
            };
            loop {
                let n = match fin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        eprintln!("failed to read input file {rel}: {err}");
                        return -15;
                    }
                };
                if let Err(err) = writer.append(&buf[..n]) {
                    eprintln!("failed to write archive data: {err}");
                    return -16;
                }
            }
        } else {
            eprintln!("ignoring unsupported file type for path: {rel}");
        }
    }

    let finalize = || -> Result<(), Box<dyn std::error::Error>> {
        let buffered = writer.finish()?;
        buffered.into_inner().map_err(|err| err.into_error())?.sync_all()?;
        Ok(())
    };
    match finalize() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("failed to finalize archive: {err}");
            -16
        }
    }
}

fn extract(archive_path: &Path, output_dir: &Path) -> i32 {
    let file = match fs::File::open(archive_path) {
        Ok(f) => f,
        Err(err) => {
            eprintln!("unable to open archive file: {err}");
            return -10;
        }
    };
    let archive = match Archive::new(file) {
        Ok(a) => a,
        Err(err) => {
            eprintln!("failed to open zar archive: {err}");
            return -11;
        }
    };
    match extract_dir(&archive, archive.root(), "", output_dir) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("extraction failed: {err}");
            -12
        }
    }
}

fn extract_dir(
    archive: &Archive<fs::File>,
    dir: NodeHandle,
    src_path: &str,
    output_dir: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(output_dir)?;
    let mut buf = vec![0u8; 64 * 1024];
    for i in 0..archive.dir_entry_count(dir) {
        let ent = archive
            .dir_entry(dir, i)
            .ok_or("directory contains an invalid node")?;
        let name = String::from_utf8_lossy(ent.name).into_owned();
        let sub_path = format!("{src_path}/{name}");
        println!("{sub_path}");
        if ent.is_directory {
            let handle = archive
                .lookup_dir(&sub_path)
                .ok_or("unable to resolve directory")?;
            extract_dir(archive, handle, &sub_path, &output_dir.join(&name))?;
        } else {
            let handle = archive
                .lookup_file(&sub_path)
                .ok_or("unable to resolve file")?;
            let mut fout = fs::File::create(output_dir.join(&name))?;
            let mut offset = 0u64;
            loop {
                let n = archive.read_at(handle, offset, &mut buf)?;
                if n == 0 {
                    break;
                }
                fout.write_all(&buf[..n])?;
                offset += n as u64;
            }
            if offset != ent.size {
                return Err("short read while extracting".into());
            }
        }
    }
    Ok(())
}
