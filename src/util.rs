use log::{error, info};

use structopt::StructOpt;

use simplelog::{LevelFilter, TermLogger, TerminalMode};

use ihex::{Reader, Record};

use avr_memory::{driver, part, parts, programmer, Error};

#[derive(Debug, StructOpt)]
#[structopt(name = "avrmem-util", about = "Read, write, verify and erase AVR memories")]
struct Options {
    #[structopt(subcommand)]
    operation: Operations,

    /// Programmer type or alias
    #[structopt(short = "c", long, default_value = "dryrun", env = "AVRMEM_PROGRAMMER")]
    programmer: String,

    /// Target part name
    #[structopt(short = "p", long, env = "AVRMEM_PART")]
    part: String,

    /// Port: a tty path, "usb" or "usb:<serial>"
    #[structopt(short = "P", long, default_value = "usb", env = "AVRMEM_PORT")]
    port: String,

    /// Accept ambiguous modes and signature mismatches
    #[structopt(short = "F", long)]
    force: bool,

    /// Never chip-erase implicitly, not even to unlock
    #[structopt(short = "e", long)]
    no_erase: bool,

    /// Extended backend parameters (key or key=value)
    #[structopt(short = "x", long = "extended-param", number_of_values = 1)]
    extparams: Vec<String>,

    /// Configure log level: 0-4 or off/error/warn/info/debug
    #[structopt(long, default_value = "info", env = "VERBOSE", parse(try_from_str = parse_level))]
    log_level: LevelFilter,
}

#[derive(Debug, StructOpt)]
enum Operations {
    /// Enter programming mode and report the device identity
    EnterProgmode,
    /// Leave programming mode
    LeaveProgmode,
    /// Erase the whole chip
    ChipErase,
    /// Read memory: <memname>[,addr,len]
    Read {
        #[structopt(parse(try_from_str = parse_memspec))]
        memspec: MemSpec,
    },
    /// Write memory: <memname>,addr,<hex bytes>
    Write {
        #[structopt(parse(try_from_str = parse_writespec))]
        writespec: WriteSpec,
    },
    /// Write and read back: <memname>,addr,<hex bytes>
    Verify {
        #[structopt(parse(try_from_str = parse_writespec))]
        writespec: WriteSpec,
    },
    /// Read or write one fuse
    Fuse {
        #[structopt(subcommand)]
        op: FuseOp,
    },
    /// Reset the target
    Reset,
    /// Dump a memory into an Intel-hex file
    Dump {
        #[structopt(parse(try_from_str = parse_memspec))]
        memspec: MemSpec,

        /// Output ihex file
        #[structopt(long, default_value = "dump.ihex")]
        file: String,
    },
    /// Load an Intel-hex file into a memory
    Load {
        /// Input ihex file
        file: String,

        /// Destination memory
        #[structopt(long, default_value = "flash")]
        mem: String,
    },
}

#[derive(Debug, StructOpt)]
enum FuseOp {
    /// Read a fuse byte: <fusename>
    Read { name: String },
    /// Write a fuse byte: <fusename> <hex value>
    Write {
        name: String,
        #[structopt(parse(try_from_str = parse_hex_byte))]
        value: u8,
    },
}

#[derive(Debug)]
struct MemSpec {
    mem: String,
    addr: u32,
    len: Option<u32>,
}

#[derive(Debug)]
struct WriteSpec {
    mem: String,
    addr: u32,
    data: Vec<u8>,
}

fn parse_level(s: &str) -> Result<LevelFilter, String> {
    match s {
        "0" => Ok(LevelFilter::Off),
        "1" => Ok(LevelFilter::Error),
        "2" => Ok(LevelFilter::Warn),
        "3" => Ok(LevelFilter::Info),
        "4" => Ok(LevelFilter::Trace),
        other => other.parse().map_err(|_| format!("bad log level {:?}", other)),
    }
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn parse_hex_byte(s: &str) -> Result<u8, String> {
    u8::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn parse_memspec(s: &str) -> Result<MemSpec, String> {
    let mut it = s.split(',');
    let mem = it.next().filter(|m| !m.is_empty()).ok_or("empty memory name")?;
    let addr = match it.next() {
        Some(a) => parse_hex(a).map_err(|e| e.to_string())?,
        None => 0,
    };
    let len = match it.next() {
        Some(l) => Some(l.parse::<u32>().map_err(|e| e.to_string())?),
        None => None,
    };
    if it.next().is_some() {
        return Err(format!("trailing fields in {:?}", s));
    }
    Ok(MemSpec {
        mem: mem.to_string(),
        addr,
        len,
    })
}

fn parse_writespec(s: &str) -> Result<WriteSpec, String> {
    let mut it = s.split(',');
    let mem = it.next().filter(|m| !m.is_empty()).ok_or("empty memory name")?;
    let addr = parse_hex(it.next().ok_or("missing address")?).map_err(|e| e.to_string())?;
    let data = hex::decode(it.next().ok_or("missing data bytes")?).map_err(|e| e.to_string())?;
    if it.next().is_some() {
        return Err(format!("trailing fields in {:?}", s));
    }
    Ok(WriteSpec {
        mem: mem.to_string(),
        addr,
        data,
    })
}

fn hexdump(base: u32, data: &[u8]) {
    for (i, chunk) in data.chunks(16).enumerate() {
        let line: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:08x}  {}", base as usize + i * 16, line.join(" "));
    }
}

fn run(opts: &Options) -> Result<(), Error> {
    let db = parts::builtin();
    let part = part::locate(&db, &opts.part)
        .ok_or_else(|| Error::UnknownPart(opts.part.clone()))?;
    let mut pgm = programmer::by_id(&opts.programmer)?;

    let session = driver::Options {
        port: opts.port.clone(),
        force: opts.force,
        no_erase: opts.no_erase,
        extparams: opts.extparams.clone(),
    };
    driver::connect(pgm.as_mut(), part, &session)?;

    let result = (|| {
        match &opts.operation {
            Operations::EnterProgmode => {
                pgm.program_enable(part)?;
                pgm.display("");
                if let Ok(v) = pgm.get_vtarget() {
                    info!("target voltage: {:.2} V", v);
                }
            }
            Operations::LeaveProgmode => {
                pgm.disable()?;
            }
            Operations::ChipErase => {
                info!("erasing chip");
                pgm.chip_erase(part)?;
                info!("chip erase complete");
            }
            Operations::Read { memspec } => {
                let mem = part.mem_or_err(&memspec.mem)?;
                let len = memspec.len.unwrap_or_else(|| mem.size.saturating_sub(memspec.addr));
                info!(
                    "reading {} bytes from {} at 0x{:04x}",
                    len, mem.name, memspec.addr
                );
                let data =
                    driver::read_region(pgm.as_mut(), part, &memspec.mem, memspec.addr, len)?;
                hexdump(memspec.addr, &data);
            }
            Operations::Write { writespec } => {
                info!(
                    "writing {} bytes to {} at 0x{:04x}",
                    writespec.data.len(),
                    writespec.mem,
                    writespec.addr
                );
                driver::write_region(
                    pgm.as_mut(),
                    part,
                    &writespec.mem,
                    writespec.addr,
                    &writespec.data,
                    opts.no_erase,
                )?;
                info!("write complete");
            }
            Operations::Verify { writespec } => {
                let n = driver::verify_region(
                    pgm.as_mut(),
                    part,
                    &writespec.mem,
                    writespec.addr,
                    &writespec.data,
                )?;
                info!("{} bytes of {} verified", n, writespec.mem);
            }
            Operations::Fuse { op } => match op {
                FuseOp::Read { name } => {
                    let v = driver::read_fuse(pgm.as_mut(), part, name, 0)?;
                    println!("{} = 0x{:02x}", name, v);
                }
                FuseOp::Write { name, value } => {
                    driver::write_fuse(pgm.as_mut(), part, name, 0, *value, opts.no_erase)?;
                    info!("{} written and verified", name);
                }
            },
            Operations::Reset => {
                driver::reset_target(pgm.as_mut(), part)?;
                info!("target reset");
            }
            Operations::Dump { memspec, file } => {
                let mem = part.mem_or_err(&memspec.mem)?;
                let len = memspec.len.unwrap_or_else(|| mem.size.saturating_sub(memspec.addr));
                info!(
                    "dumping {} bytes of {} at 0x{:04x} to {}",
                    len, mem.name, memspec.addr, file
                );
                let data =
                    driver::read_region(pgm.as_mut(), part, &memspec.mem, memspec.addr, len)?;

                let mut records = Vec::new();
                for (i, chunk) in data.chunks(32).enumerate() {
                    records.push(Record::Data {
                        offset: (memspec.addr as usize + i * 32) as u16,
                        value: chunk.to_vec(),
                    });
                }
                records.push(Record::EndOfFile);
                let text = ihex::create_object_file_representation(&records)
                    .map_err(|e| Error::Config(format!("ihex: {}", e)))?;
                std::fs::write(file, text)?;
                info!("dump complete");
            }
            Operations::Load { file, mem } => {
                info!("loading {} into {}", file, mem);
                let text = String::from_utf8(std::fs::read(file)?)
                    .map_err(|e| Error::Config(format!("{} is not text: {}", file, e)))?;
                for record in Reader::new(&text) {
                    match record {
                        Ok(Record::Data { offset, value }) => {
                            driver::write_region(
                                pgm.as_mut(),
                                part,
                                mem,
                                u32::from(offset),
                                &value,
                                opts.no_erase,
                            )?;
                        }
                        Ok(Record::EndOfFile) => (),
                        Ok(other) => {
                            return Err(Error::Config(format!(
                                "unsupported ihex record {:?}",
                                other
                            )));
                        }
                        Err(e) => {
                            return Err(Error::Config(format!("ihex reader: {}", e)));
                        }
                    }
                }
                info!("load complete");
            }
        }
        Ok(())
    })();

    driver::shutdown(pgm.as_mut());
    result
}

fn main() {
    let opts = Options::from_args();

    TermLogger::init(
        opts.log_level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
    )
    .unwrap();

    if let Err(e) = run(&opts) {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}
