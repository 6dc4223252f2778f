mod device;
mod wire;

use std::io::{Read, Write};
use std::process::ExitCode;

use hexloader::{SessionEnd, session};

mod args {
    #[derive(clap::Parser)]
    #[command(author, version, about = "Drive the hexloader core against a simulated device")]
    pub struct Args {
        /// Firmware image to program (ELF or Intel HEX)
        #[arg(short, long)]
        pub load: Option<clio::Input>,

        /// Send a lone quit command instead of programming
        #[arg(short, long)]
        pub quit: bool,

        /// Write the simulated flash content out after the session
        #[arg(short, long)]
        pub dump: Option<clio::Output>,
    }
}

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

fn main() -> ExitCode {
    env_logger::init();

    let args = <args::Args as clap::Parser>::parse();

    let mut stream = Vec::new();
    let mut image = Vec::new();

    if args.quit {
        stream.push(b'Q');
    } else if let Some(mut f) = args.load {
        let mut data = Vec::new();
        f.read_to_end(&mut data).unwrap();

        image = match wire::flatten(&data) {
            Ok(image) => image,
            Err(e) => {
                log::error!("{e}");
                return ExitCode::from(2);
            }
        };
        log::info!("image is {} bytes, sending as hex records", image.len());
        wire::encode(&image, &mut stream);
    }

    let mut chan = device::HostChannel::new(stream);
    let mut flash = device::SimFlash::new();
    let mut board = device::HostBoard::default();

    let end = session::run::<{ device::PAGE_SIZE }, _, _, _>(
        &mut chan,
        &mut flash,
        &mut board,
        session::IDLE_TIMEOUT_MS,
    );

    for line in chan.transcript() {
        log::debug!("device: {line}");
    }

    if let Some(mut f) = args.dump {
        f.write_all(flash.contents()).unwrap();
    }

    match end {
        Ok(SessionEnd::Complete) => {
            let programmed = image.len().min(device::APP_END);
            if flash.contents()[..programmed] != image[..programmed] {
                log::error!("flash content does not match the image");
                return ExitCode::FAILURE;
            }
            log::info!(
                "programmed {} bytes with {} acks, crc32 0x{:08x}",
                programmed,
                chan.acks(),
                CRC32.checksum(&flash.contents()[..programmed])
            );
            ExitCode::SUCCESS
        }
        Ok(SessionEnd::Quit) => {
            log::info!("loader acknowledged quit");
            if args.quit { ExitCode::SUCCESS } else { ExitCode::FAILURE }
        }
        Err(err) => {
            log::error!("session failed: {err:?}");
            ExitCode::FAILURE
        }
    }
}
