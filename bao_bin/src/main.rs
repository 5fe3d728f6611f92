//! The `bao` command line utility: hash content, produce combined or
//! outboard encodings, decode them against a hash, and extract or decode
//! verified slices.

#[macro_use]
extern crate arrayref;

use failure::{err_msg, Error};
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::os::unix::io::OwnedFd;
use std::io;
use std::path::{Path, PathBuf};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "
Usage: bao hash [<input>] [--encoded | --outboard=<file>]
       bao encode <input> (<output> | --outboard=<file>)
       bao decode <hash> [<input>] [<output>] [--outboard=<file>]
       bao slice <start> <len> [<input>] [<output>] [--outboard=<file>]
       bao decode-slice <hash> <start> <len> [<input>] [<output>]
       bao (--help | --version)
";

#[derive(Debug, Deserialize)]
struct Args {
    cmd_decode: bool,
    cmd_encode: bool,
    cmd_hash: bool,
    cmd_slice: bool,
    cmd_decode_slice: bool,
    arg_input: Option<PathBuf>,
    arg_output: Option<PathBuf>,
    arg_hash: String,
    arg_start: u64,
    arg_len: u64,
    flag_encoded: bool,
    flag_help: bool,
    flag_outboard: Option<PathBuf>,
    flag_version: bool,
}

fn main() -> Result<(), Error> {
    let args: Args = docopt::Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    if args.flag_help {
        print!("{}", USAGE);
    } else if args.flag_version {
        println!("{}", VERSION);
    } else if args.cmd_hash {
        hash(&args)?;
    } else if args.cmd_encode {
        encode(&args)?;
    } else if args.cmd_decode {
        decode(&args)?;
    } else if args.cmd_slice {
        slice(&args)?;
    } else if args.cmd_decode_slice {
        decode_slice(&args)?;
    } else {
        unreachable!();
    }

    Ok(())
}

fn hash(args: &Args) -> Result<(), Error> {
    let mut in_file = open_input(&args.arg_input)?;
    let hash;
    if args.flag_encoded {
        hash = bao::decode::hash_from_encoded(&mut in_file)?;
    } else if args.flag_outboard.is_some() {
        let mut outboard_file = open_input(&args.flag_outboard)?;
        hash = bao::decode::hash_from_outboard_encoded(&mut in_file, &mut outboard_file)?;
    } else if let Some(map) = maybe_memmap_input(&in_file)? {
        hash = bao::hash::hash(&map);
    } else {
        let mut writer = bao::hash::Writer::new();
        io::copy(&mut in_file, &mut writer)?;
        hash = writer.finish();
    }
    println!("{}", hex::encode(hash));
    Ok(())
}

fn encode(args: &Args) -> Result<(), Error> {
    let mut in_file = open_input(&args.arg_input)?;
    let outboard = args.flag_outboard.is_some();
    let out_maybe_path = if outboard {
        &args.flag_outboard
    } else {
        &args.arg_output
    };
    let out_file = open_output(out_maybe_path)?;
    if let Some(in_map) = maybe_memmap_input(&in_file)? {
        let target_len = if outboard {
            bao::encode::outboard_size(in_map.len() as u64)
        } else {
            bao::encode::encoded_size(in_map.len() as u64)
        };
        if let Some(mut out_map) = maybe_memmap_output(&out_file, target_len)? {
            if outboard {
                bao::encode::encode_outboard(&in_map, &mut out_map);
            } else {
                bao::encode::encode(&in_map, &mut out_map);
            }
            return Ok(());
        }
    }
    // If one or both of the files weren't mappable, fall back to the writer,
    // which buffers the input in memory.
    let mut writer = if outboard {
        bao::encode::Writer::new_outboard(out_file)
    } else {
        bao::encode::Writer::new(out_file)
    };
    io::copy(&mut in_file, &mut writer)?;
    writer.finish()?;
    Ok(())
}

fn decode(args: &Args) -> Result<(), Error> {
    let in_file = open_input(&args.arg_input)?;
    let mut out_file = open_output(&args.arg_output)?;
    let hash = parse_hash(args)?;
    // In the combined case, try to memmap the files.
    if args.flag_outboard.is_none() {
        if let Some(in_map) = maybe_memmap_input(&in_file)? {
            let content_len = bao::decode::parse_and_check_content_len(&in_map)?;
            if let Some(mut out_map) = maybe_memmap_output(&out_file, content_len as u128)? {
                bao::decode::decode(&in_map, &mut out_map, &hash)?;
                return Ok(());
            }
        }
    }
    // If the files weren't mappable, or if we're outboard, fall back to the
    // streaming reader.
    if args.flag_outboard.is_some() {
        let outboard_file = open_input(&args.flag_outboard)?;
        let mut reader = bao::decode::Reader::new_outboard(&in_file, &outboard_file, &hash);
        allow_broken_pipe(io::copy(&mut reader, &mut out_file))?;
    } else {
        let mut reader = bao::decode::Reader::new(&in_file, &hash);
        allow_broken_pipe(io::copy(&mut reader, &mut out_file))?;
    }
    Ok(())
}

fn slice(args: &Args) -> Result<(), Error> {
    let in_file = open_input(&args.arg_input)?;
    let mut out_file = open_output(&args.arg_output)?;
    // Slice extraction seeks over the parts of the encoding that aren't in
    // the slice, so it requires real files.
    confirm_real_file(&in_file, "slice input")?;
    if args.flag_outboard.is_some() {
        let outboard_file = open_input(&args.flag_outboard)?;
        confirm_real_file(&outboard_file, "slice input")?;
        let mut extractor = bao::decode::SliceExtractor::new_outboard(
            in_file,
            outboard_file,
            args.arg_start,
            args.arg_len,
        );
        io::copy(&mut extractor, &mut out_file)?;
    } else {
        let mut extractor = bao::decode::SliceExtractor::new(in_file, args.arg_start, args.arg_len);
        io::copy(&mut extractor, &mut out_file)?;
    }
    Ok(())
}

fn decode_slice(args: &Args) -> Result<(), Error> {
    let in_file = open_input(&args.arg_input)?;
    let mut out_file = open_output(&args.arg_output)?;
    let hash = parse_hash(args)?;
    let mut reader = bao::decode::SliceReader::new(in_file, &hash, args.arg_start, args.arg_len);
    allow_broken_pipe(io::copy(&mut reader, &mut out_file))?;
    Ok(())
}

fn open_input(maybe_path: &Option<PathBuf>) -> Result<File, Error> {
    Ok(if let Some(ref path) = maybe_path {
        if path == Path::new("-") {
            File::from(OwnedFd::from(os_pipe::dup_stdin()?))
        } else {
            File::open(path)?
        }
    } else {
        File::from(OwnedFd::from(os_pipe::dup_stdin()?))
    })
}

fn open_output(maybe_path: &Option<PathBuf>) -> Result<File, Error> {
    Ok(if let Some(ref path) = maybe_path {
        if path == Path::new("-") {
            File::from(OwnedFd::from(os_pipe::dup_stdout()?))
        } else {
            // Both reading and writing permissions are required for MmapMut.
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?
        }
    } else {
        File::from(OwnedFd::from(os_pipe::dup_stdout()?))
    })
}

fn maybe_memmap_input(in_file: &File) -> Result<Option<memmap::Mmap>, Error> {
    let metadata = in_file.metadata()?;
    Ok(if !metadata.is_file() {
        // Not a file.
        None
    } else if metadata.len() == 0 {
        // Empty files can't be mapped.
        None
    } else if metadata.len() > isize::max_value() as u64 {
        // Too long to safely map. https://github.com/danburkert/memmap-rs/issues/69
        None
    } else {
        let map = unsafe { memmap::Mmap::map(in_file)? };
        assert!(map.len() <= isize::max_value() as usize);
        Some(map)
    })
}

fn maybe_memmap_output(
    out_file: &File,
    target_len: u128,
) -> Result<Option<memmap::MmapMut>, Error> {
    if target_len > u64::max_value() as u128 {
        panic!("unreasonable target length: {}", target_len);
    }
    let metadata = out_file.metadata()?;
    Ok(if !metadata.is_file() {
        // Not a file.
        None
    } else if metadata.len() != 0 {
        // The output file hasn't been truncated. Likely opened in append mode.
        None
    } else if target_len == 0 {
        // Empty files can't be mapped.
        None
    } else if target_len > isize::max_value() as u128 {
        // Too long to safely map. https://github.com/danburkert/memmap-rs/issues/69
        None
    } else {
        out_file.set_len(target_len as u64)?;
        let map = unsafe { memmap::MmapMut::map_mut(out_file)? };
        assert_eq!(map.len() as u128, target_len);
        Some(map)
    })
}

fn confirm_real_file(file: &File, name: &str) -> Result<(), Error> {
    if !file.metadata()?.is_file() {
        Err(err_msg(format!("{} must be a real file", name)))
    } else {
        Ok(())
    }
}

fn parse_hash(args: &Args) -> Result<[u8; bao::hash::HASH_SIZE], Error> {
    let hash_vec = hex::decode(&args.arg_hash).map_err(|_| err_msg("invalid hex"))?;
    if hash_vec.len() != bao::hash::HASH_SIZE {
        return Err(err_msg("wrong length hash"));
    };
    Ok(*array_ref!(hash_vec, 0, bao::hash::HASH_SIZE))
}

// When streaming out decoded content, it's acceptable for the caller to pipe
// us into e.g. `head -c 100`. We catch closed pipe errors in that case and
// avoid erroring out. When encoding, though, we let those errors stay noisy,
// since truncating an encoding is almost never correct.
fn allow_broken_pipe<T>(result: io::Result<T>) -> io::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            if e.kind() == io::ErrorKind::BrokenPipe {
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}
