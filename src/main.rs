use std::{
    env,
    net::{IpAddr, Ipv6Addr},
    process,
    str::FromStr,
};

mod ikev2;
mod logger;

const USAGE_INSTRUCTIONS: &str = "Usage:
> ikaros [OPTIONS] serve
Options:
      --log-level=<LOG_LEVEL> Log level, defaults to info
      --listen-ip=<IP> Listen IP address, may be specified multiple times, defaults to ::
      --port=<PORT> IKE UDP port, defaults to 500
      --nat-port=<PORT> NAT traversal UDP port, defaults to 4500
> ikaros help";

struct Args {
    log_level: log::LevelFilter,
    config: ikev2::Config,
}

impl Args {
    fn parse() -> Args {
        fn fail_with_error(name: &str, value: &str, err: &dyn std::error::Error) -> ! {
            eprintln!("Argument {} has an unsupported value {}: {}", name, value, err);
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        }
        let mut log_level = log::LevelFilter::Info;
        let mut listen_ips = Vec::new();
        let mut port = 500u16;
        let mut nat_port = 4500u16;
        let mut serve = false;
        for arg in env::args().skip(1) {
            if let Some((name, value)) = arg.split_once('=') {
                match name {
                    "--log-level" => match log::LevelFilter::from_str(value) {
                        Ok(level) => log_level = level,
                        Err(err) => fail_with_error(name, value, &err),
                    },
                    "--listen-ip" => match IpAddr::from_str(value) {
                        Ok(ip) => listen_ips.push(ip),
                        Err(err) => fail_with_error(name, value, &err),
                    },
                    "--port" => match u16::from_str(value) {
                        Ok(value) => port = value,
                        Err(err) => fail_with_error(name, value, &err),
                    },
                    "--nat-port" => match u16::from_str(value) {
                        Ok(value) => nat_port = value,
                        Err(err) => fail_with_error(name, value, &err),
                    },
                    _ => {
                        eprintln!("Unsupported argument {}", arg);
                        println!("{}", USAGE_INSTRUCTIONS);
                        process::exit(2);
                    }
                }
            } else if arg == "serve" {
                serve = true;
            } else if arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            } else {
                eprintln!("Unsupported command {}", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            }
        }
        if !serve {
            eprintln!("No command specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        }
        if listen_ips.is_empty() {
            listen_ips.push(IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        }
        Args {
            log_level,
            config: ikev2::Config {
                listen_ips,
                port,
                nat_port,
            },
        }
    }
}

fn main() {
    let args = Args::parse();
    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger: {}", err);
        process::exit(1);
    }
    let server = ikev2::Server::new(args.config);
    if let Err(err) = server.run() {
        eprintln!("Server failed: {}", err);
        process::exit(1);
    }
}
