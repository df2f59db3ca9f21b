static HELP_STR_LOCK: &str = "
    The fully qualified path of the advisory lock file shared by every \
                              client of this fork server. Concurrent \
                              callers serialize their request/reply \
                              exchanges on it. Example value: \
                              \"/run/zygoted.lock\"
";

#[derive(clap::Parser)]
#[command(
    name = "zygoted",
    version,
    about = "zygoted",
    long_about = "A privileged zygote fork server: spawns worker \
                  processes cheaply by forking a pre-warmed manager, \
                  passes descriptors across the trust boundary and \
                  serves blessed resource files from a descriptor cache"
)]
pub enum Args {
    Serve {
        #[arg(
            long,
            short = 'f',
            value_name = "DAEMONIZE",
            help = "Run in background (double-fork). Example value: false",
            default_value = "false"
        )]
        daemonize: bool,

        #[arg(
            long,
            short,
            value_name = "LOCK_PATH",
            help = HELP_STR_LOCK,
            default_value = "/tmp/zygoted.lock"
        )]
        lock_path: String,

        #[arg(
            long,
            short = 'l',
            value_name = "LOG_PATH",
            help = "Optional log path value. If not provided, logs will \
                    placed in /tmp/zygoted-$PID.log"
        )]
        log_path: Option<String>,

        #[arg(
            long,
            short = 's',
            value_name = "PAK_SUFFIX",
            help = "Required suffix for files served over the Open \
                    operation",
            default_value = ".pak"
        )]
        pak_suffix: String,
    },
}
