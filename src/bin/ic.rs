use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::StreamExt;

use structopt::StructOpt;

use prettytable::{cell, format::FormatBuilder, row, table, Table};

use log::debug;

use tokio::net::TcpStream;

use insteon::*;

#[derive(StructOpt, Debug)]
#[structopt(name = "ic", about = "INSTEON control")]
struct App {
    /// A path to a serial device with an INSTEON modem connected, e.g. /dev/ttyUSB0
    #[structopt(short, long, parse(from_os_str), conflicts_with = "host", required_unless = "host")]
    device: Option<PathBuf>,

    /// A host to connect over TCP
    #[structopt(short, long, conflicts_with = "device", required_unless = "device")]
    host: Option<String>,

    /// Seconds to wait for a device to answer
    #[structopt(short, long, default_value = "10")]
    timeout: u64,

    /// Hops an outgoing message may take, 0 to 3
    #[structopt(long, default_value = "3")]
    ttl: u8,

    #[structopt(subcommand)]
    command: AppCommand,
}

#[derive(StructOpt, Debug)]
enum AppCommand {
    Modem(ModemCommand),
    /// Print every message the modem receives
    Listen,
    Device(DeviceArgs),
    /// Link every pair of devices both ways on a group
    Crosslink {
        group: u8,
        #[structopt(required = true, min_values = 2)]
        addresses: Vec<Address>,
    },
    /// Remove every link between two devices, in both directions
    UnlinkAll {
        controller: Address,
        responder: Address,
    },
    /// List records that appear more than once in a device's database
    Duplicates { address: Address },
}

#[derive(StructOpt, Debug)]
#[structopt(about = "Device commands")]
struct DeviceArgs {
    /// Address of the device
    address: Address,

    #[structopt(subcommand)]
    command: DeviceCommand,
}

#[derive(StructOpt, Debug)]
enum DeviceCommand {
    /// Ask the device to identify itself
    Info,
    /// Retrieve the INSTEON engine version
    Version,
    /// Print the device's link database
    Links,
    /// Make the device control a responder
    Link {
        responder: Address,

        #[structopt(short, long, default_value = "1")]
        group: u8,

        /// Link even if the link looks complete already
        #[structopt(short, long)]
        force: bool,
    },
    /// Remove the link where the device controls a responder
    Unlink {
        responder: Address,

        #[structopt(short, long, default_value = "1")]
        group: u8,
    },
    /// Take the device out of linking mode
    ExitLink,
    /// Ping a device
    Ping,
}

#[derive(StructOpt, Debug)]
#[structopt(about = "Modem commands")]
enum ModemCommand {
    Info,
    Links,
    LinkDevice {
        /// The address of the device to link
        address: Option<Address>,

        /// Links the modem as a controller of the linked device
        #[structopt(short, long, conflicts_with = "responder", conflicts_with = "delete")]
        controller: bool,

        /// Links the modem as a responder to the linked device
        #[structopt(short, long, conflicts_with = "controller", conflicts_with = "delete")]
        responder: bool,

        /// Deletes the link from the linked device
        #[structopt(
            short,
            long,
            conflicts_with = "controller",
            conflicts_with = "responder"
        )]
        delete: bool,

        /// The group number to link, defaults to 1
        #[structopt(short, long, default_value = "1")]
        group: u8,
    },
}

fn create_table() -> Table {
    let mut table = Table::new();
    let format = FormatBuilder::new()
        .column_separator(' ')
        .padding(0, 1)
        .build();

    table.set_format(format);
    table
}

macro_rules! ptable {
	($($e:tt), +) => {
		let mut table = table!($($e),+);
		let format = FormatBuilder::new()
			.column_separator(' ')
			.padding(0, 1)
			.build();

		table.set_format(format);
		table.printstd();
    };
}

fn print_links<'a>(links: impl IntoIterator<Item = &'a LinkRecord>) {
    let mut table = create_table();
    table.set_titles(row![b->"Address", b->"Mode", b->"Group", b->"Data"]);

    for link in links {
        let mode = if link.flags.controller() {
            "Controller"
        } else {
            "Responder"
        };
        let data = format!(
            "{:02x} {:02x} {:02x}",
            link.data[0], link.data[1], link.data[2]
        );

        table.add_row(row![link.address, mode, link.group, data]);
    }

    table.printstd();
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

async fn modem_info(modem: &Modem) -> Result<()> {
    let info = modem.get_info().await?;

    ptable!(
        ["Address", info.address],
        ["Category", info.category],
        ["Subcategory", info.sub_category],
        ["Firmware Version", info.firmware_version]
    );
    Ok(())
}

async fn modem_links(modem: &Modem) -> Result<()> {
    let links = modem.get_links().await?;
    print_links(&links);
    Ok(())
}

async fn modem_link(
    modem: &Modem,
    address: Option<Address>,
    mode: AllLinkMode,
    group: u8,
) -> anyhow::Result<()> {
    let response = modem.link_device(address, mode, group).await?;

    ptable!(
        ["Address", response.address],
        ["Mode", response.mode],
        ["Group", response.group],
        ["Category", response.category],
        ["Subcategory", response.sub_category],
        ["Firmware Version", response.firmware_version]
    );

    Ok(())
}

async fn message_listen(modem: &Modem) -> Result<()> {
    let mut listener = modem.listen();

    while let Some(message) = listener.next().await {
        println!("{}", message);
    }

    Ok(())
}

/// Opens the device at `address`, offering to link it to the modem first if
/// it refuses to talk to an unlinked modem.
async fn open_device(
    modem: &Modem,
    address: Address,
    config: &ConnectionConfig,
) -> Result<Box<dyn Device>> {
    match modem.open(address, config.clone()).await {
        Err(Error::NotLinked) => {
            if !confirm(&format!("{} is not linked to the modem. Link it now?", address))? {
                bail!("{} is not linked to the modem", address);
            }

            modem
                .link_device(Some(address), AllLinkMode::Controller, 0)
                .await
                .with_context(|| format!("Failed to link {} to the modem", address))?;
            Ok(modem.open(address, config.clone()).await?)
        }
        result => result.with_context(|| format!("Failed to open {}", address)),
    }
}

fn linkable(device: &dyn Device) -> Result<&dyn Linkable> {
    Ok(device
        .as_linkable()
        .ok_or_else(|| Error::NotLinkable(device.address()))?)
}

async fn handle_device_command(
    modem: &Modem,
    config: &ConnectionConfig,
    args: DeviceArgs,
) -> Result<()> {
    let address = args.address;

    match args.command {
        DeviceCommand::Info => {
            let connection = modem.connect(address, config.clone())?;
            let (firmware, devcat) = connection.id_request().await?;
            ptable!(
                ["Address", address],
                ["Category", devcat],
                ["Firmware Version", firmware]
            );
        }
        DeviceCommand::Version => {
            let connection = modem.connect(address, config.clone())?;
            match connection.engine_version().await {
                Ok(version) => println!("{}", version),
                Err(Error::NotLinked) => println!("I2Cs (not linked to the modem)"),
                Err(e) => return Err(e.into()),
            }
        }
        DeviceCommand::Links => {
            let device = open_device(modem, address, config).await?;
            let links = linkable(device.as_ref())?.links().await?;
            print_links(links.iter().filter(|link| link.flags.in_use()));
        }
        DeviceCommand::Link {
            responder,
            group,
            force,
        } => {
            let controller = open_device(modem, address, config).await?;
            let responder = open_device(modem, responder, config).await?;
            let linker = Linker::new();
            let (controller, responder) = (
                linkable(controller.as_ref())?,
                linkable(responder.as_ref())?,
            );

            if force {
                linker.force_link(Group(group), controller, responder).await?;
            } else {
                match linker.link(Group(group), controller, responder).await {
                    Err(Error::AlreadyLinked) => println!("Already linked"),
                    result => result?,
                }
            }
        }
        DeviceCommand::Unlink { responder, group } => {
            let controller = open_device(modem, address, config).await?;
            let responder = open_device(modem, responder, config).await?;
            Linker::new()
                .unlink(
                    Group(group),
                    linkable(controller.as_ref())?,
                    linkable(responder.as_ref())?,
                )
                .await?;
        }
        DeviceCommand::ExitLink => {
            let device = open_device(modem, address, config).await?;
            linkable(device.as_ref())?.exit_linking_mode().await?;
        }
        DeviceCommand::Ping => {
            let connection = modem.connect(address, config.clone())?;
            connection.send_command(Command::PING, Vec::new()).await?;
            println!("{} answered", address);
        }
    }

    Ok(())
}

async fn crosslink(
    modem: &Modem,
    config: &ConnectionConfig,
    group: u8,
    addresses: &[Address],
) -> Result<()> {
    let mut devices = Vec::new();
    for address in addresses {
        devices.push(open_device(modem, *address, config).await?);
    }

    let linkables = devices
        .iter()
        .map(|device| linkable(device.as_ref()))
        .collect::<Result<Vec<_>>>()?;

    Linker::new().cross_link_all(Group(group), &linkables).await?;
    Ok(())
}

async fn unlink_all(
    modem: &Modem,
    config: &ConnectionConfig,
    controller: Address,
    responder: Address,
) -> Result<()> {
    let controller = open_device(modem, controller, config).await?;
    let responder = open_device(modem, responder, config).await?;

    Linker::new()
        .unlink_all(linkable(controller.as_ref())?, linkable(responder.as_ref())?)
        .await?;
    Ok(())
}

async fn duplicates(modem: &Modem, config: &ConnectionConfig, address: Address) -> Result<()> {
    let device = open_device(modem, address, config).await?;
    let duplicates = find_duplicate_links(linkable(device.as_ref())?).await?;

    if duplicates.is_empty() {
        println!("No duplicate links");
    } else {
        print_links(&duplicates);
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let app = App::from_args();

    debug!("{:#?}", app);

    let config = ConnectionConfig::default()
        .with_timeout(Duration::from_secs(app.timeout))
        .with_ttl(app.ttl);

    let modem = match (app.device, app.host) {
        (Some(device), _) => Modem::from_path(device).with_context(|| "Failed to open modem")?,
        (None, Some(host)) => {
            let stream = TcpStream::connect(host)
                .await
                .with_context(|| "Failed to connect")?;
            Modem::new(stream)
        }
        (None, None) => bail!("Either a device or a host is required"),
    };

    match app.command {
        AppCommand::Modem(ModemCommand::Info) => modem_info(&modem).await?,
        AppCommand::Modem(ModemCommand::Links) => modem_links(&modem).await?,
        AppCommand::Modem(ModemCommand::LinkDevice {
            address,
            controller,
            responder,
            delete,
            group,
        }) => {
            let mode = if controller {
                AllLinkMode::Controller
            } else if responder {
                AllLinkMode::Responder
            } else if delete {
                AllLinkMode::Delete
            } else {
                AllLinkMode::Auto
            };

            modem_link(&modem, address, mode, group).await?
        }
        AppCommand::Listen => message_listen(&modem).await?,
        AppCommand::Device(args) => handle_device_command(&modem, &config, args).await?,
        AppCommand::Crosslink { group, addresses } => {
            crosslink(&modem, &config, group, &addresses).await?
        }
        AppCommand::UnlinkAll {
            controller,
            responder,
        } => unlink_all(&modem, &config, controller, responder).await?,
        AppCommand::Duplicates { address } => duplicates(&modem, &config, address).await?,
    }

    Ok(())
}
