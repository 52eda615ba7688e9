use execfork::{cli, run};

fn main() {
    let result = cli::get_args().and_then(|args| {
        run::init_logger(args.verbose);
        run::run(args)
    });

    if let Err(err) = result {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
