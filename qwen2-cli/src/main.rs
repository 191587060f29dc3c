use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::error;
use qwen2_inference::{run_inference, InferenceConfig, Mode};

fn build_command() -> Command {
    Command::new("qwen2")
        .about("Qwen2 inference in Rust: chat and instruct over GGUF models")
        .arg(
            Arg::new("model")
                .short('m')
                .long("model")
                .value_name("PATH")
                .help("Path to the .gguf model file")
                .required(true),
        )
        .arg(
            Arg::new("chat")
                .short('i')
                .long("chat")
                .visible_alias("interactive")
                .help("Run in chat mode")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("instruct")
                .long("instruct")
                .help("Run in instruct (single turn) mode, the default")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("prompt")
                .short('p')
                .long("prompt")
                .value_name("STRING")
                .help("Input prompt, required in instruct mode"),
        )
        .arg(
            Arg::new("system-prompt")
                .long("system-prompt")
                .visible_alias("sp")
                .value_name("STRING")
                .help("System prompt"),
        )
        .arg(
            Arg::new("temperature")
                .long("temperature")
                .visible_alias("temp")
                .value_name("FLOAT")
                .help("Temperature in [0, inf], 0 means greedy")
                .default_value("0.1")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("top-p")
                .long("top-p")
                .value_name("FLOAT")
                .help("p value for top-p (nucleus) sampling in [0, 1]")
                .default_value("0.95")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("LONG")
                .help("Random seed, defaults to the system clock")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("max-tokens")
                .short('n')
                .long("max-tokens")
                .value_name("INT")
                .help("Number of steps to run for, < 0 = limited by context length")
                .default_value("512")
                .allow_hyphen_values(true)
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("stream")
                .long("stream")
                .value_name("BOOL")
                .help("Print tokens during generation; may cause encoding artifacts for non ASCII text")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new("echo")
                .long("echo")
                .value_name("BOOL")
                .help("Print ALL tokens to stderr; recommended with --stream=false")
                .default_value("false")
                .value_parser(clap::value_parser!(bool)),
        )
}

fn config_from_matches(matches: &ArgMatches) -> Result<InferenceConfig> {
    let mode = if matches.get_flag("chat") { Mode::Chat } else { Mode::Instruct };

    InferenceConfig::builder()
        .model_path(matches.get_one::<String>("model"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .topp(matches.get_one::<f32>("top-p").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .max_tokens(matches.get_one::<i64>("max-tokens").copied())
        .mode(Some(mode))
        .prompt(matches.get_one::<String>("prompt"))
        .system_prompt(matches.get_one::<String>("system-prompt"))
        .stream(matches.get_one::<bool>("stream").copied())
        .echo(matches.get_one::<bool>("echo").copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))
}

fn execute() -> Result<()> {
    // Clean log format: message only, no timestamp or module prefix.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = build_command().get_matches();
    let config = config_from_matches(&matches)?;
    run_inference(config)
}

fn main() {
    if let Err(e) = execute() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
