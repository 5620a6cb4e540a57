// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::env;
use std::path::Path;
use std::process;

use getopts::Options;

const BRIEF: &str = "Usage: ducible IMAGE [PDB] [options]

Rewrites a PE/PE+ image, and optionally its PDB, so that identical inputs
link to byte-identical outputs.";

fn main() {
    let args: Vec<String> = env::args().collect();
    process::exit(run(&args));
}

fn run(args: &[String]) -> i32 {
    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help and exit");
    opts.optflag("", "version", "print the version and exit");
    opts.optflag("n", "dryrun", "report the rewrites without applying them");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(fail) => {
            eprintln!("Error: {}", fail);
            return 1;
        }
    };

    if matches.opt_present("help") {
        print!("{}", opts.usage(BRIEF));
        return 0;
    }

    if matches.opt_present("version") {
        println!("ducible {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    if matches.free.is_empty() || matches.free.len() > 2 {
        eprintln!("Error: expected an IMAGE path and at most one PDB path");
        eprintln!("{}", BRIEF);
        return 1;
    }

    let image = Path::new(&matches.free[0]);
    let pdb = matches.free.get(1).map(Path::new);
    let dry_run = matches.opt_present("dryrun");

    match ducible::patch_image(image, pdb, dry_run) {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("Error: {}", error);
            1
        }
    }
}
