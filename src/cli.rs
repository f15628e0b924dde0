use clap::Parser;

#[derive(Parser)]
#[clap(author, version, about = "Per-host agent that executes administrative commands delivered over the broadcaster bus")]
pub struct ReceiverCli {
    /// The path to the receiver's INI configuration file.
    #[clap(
        short,
        long,
        value_parser,
        value_name = "FILENAME",
        default_value = "/etc/yadt-receiver.conf"
    )]
    pub config: String,
}
