use anyhow::Result;
use clap::{arg, AppSettings, ArgAction, Command};

mod serve;

pub struct CmdData {
    verbose: bool,
    name: String,
}

pub async fn run() -> Result<()> {
    let matches = Command::new("textbeam")
        .version("0.1")
        .arg(
            arg!(
            -v --verbose "Enable verbose output"
            )
            .action(ArgAction::SetTrue),
        )
        .arg(
            arg!(
                -n --name <NAME> "Set the advertised device name"
            )
            .required(false)
            .default_value("textbeam"),
        )
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(serve::subcmd())
        .get_matches();

    let verbose = *matches.get_one::<bool>("verbose").unwrap();
    let name = matches.get_one::<String>("name").unwrap().clone();

    let mut data = CmdData { verbose, name };

    match matches.subcommand() {
        Some(("serve", matches)) => serve::cmd(&mut data, matches).await,
        _ => unreachable!(),
    }
}
