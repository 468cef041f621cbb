// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Analysis options.

use clap::{Arg, Command};
use itertools::Itertools;

const ANDERS_USAGE: &str = r#"anders [OPTIONS]"#;

/// Creates the clap::Command metadata for argument parsing.
fn make_options_parser() -> Command<'static> {
    Command::new("anders")
        .no_binary_name(true)
        .override_usage(ANDERS_USAGE)
        .arg(Arg::new("entry-func")
            .long("entry-func")
            .takes_value(true)
            .default_value("main")
            .help("The name of the entry function from which the analysis begins."))
        .arg(Arg::new("no-spec")
            .long("no-spec")
            .takes_value(false)
            .help("Disable all speculative assumptions drawn from dynamic profiles."))
        .arg(Arg::new("no-opt")
            .long("no-opt")
            .takes_value(false)
            .help("Disable the offline cycle-detection pre-pass."))
        .arg(Arg::new("debug-id")
            .long("debug-id")
            .takes_value(true)
            .multiple_occurrences(true)
            .value_parser(clap::value_parser!(u32))
            .help("Print the points-to set of the given node after solving."))
        .arg(Arg::new("debug-fcn")
            .long("debug-fcn")
            .takes_value(true)
            .multiple_occurrences(true)
            .help("Print the points-to sets of a function's values after solving."))
        .arg(Arg::new("debug-glbl")
            .long("debug-glbl")
            .takes_value(true)
            .help("Print the points-to set of the given global after solving."))
        .arg(Arg::new("do-spec-diff")
            .long("do-spec-diff")
            .takes_value(false)
            .help("Report points-to size accounting for speculative runs."))
        .arg(Arg::new("do-check-dyn")
            .long("do-check-dyn")
            .takes_value(false)
            .help("Report the speculative assumptions made against dynamic data."))
        .arg(Arg::new("dump-stats")
            .long("dump-stats")
            .takes_value(false)
            .help("Dump the statistics of the analysis results."))
        .arg(Arg::new("pts-output")
            .long("dump-pts")
            .takes_value(true)
            .help("Dump points-to results to the output file."))
        .arg(Arg::new("used-info")
            .long("used-info")
            .takes_value(true)
            .help("Path to the used-function dynamic profile."))
        .arg(Arg::new("indir-info")
            .long("indir-info")
            .takes_value(true)
            .help("Path to the indirect-call-target dynamic profile."))
        .arg(Arg::new("call-contexts")
            .long("call-contexts")
            .takes_value(true)
            .help("Path to the call-context dynamic profile."))
}

#[derive(Clone, Debug)]
pub struct AnalysisOptions {
    pub entry_func: String,
    /// Disables every use of the dynamic-profile oracles.
    pub no_spec: bool,
    /// Disables the offline cycle-detection pre-pass.
    pub no_opt: bool,

    pub debug_ids: Vec<u32>,
    pub debug_fcn_names: Vec<String>,
    pub debug_global_name: Option<String>,
    pub do_spec_diff: bool,
    pub do_check_dyn: bool,
    pub dump_stats: bool,
    pub pts_output: Option<String>,

    pub used_info_path: Option<String>,
    pub indir_info_path: Option<String>,
    pub call_contexts_path: Option<String>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            entry_func: "main".to_string(),
            no_spec: false,
            no_opt: false,
            debug_ids: Vec::new(),
            debug_fcn_names: Vec::new(),
            debug_global_name: None,
            do_spec_diff: false,
            do_check_dyn: false,
            dump_stats: false,
            pts_output: None,
            used_info_path: None,
            indir_info_path: None,
            call_contexts_path: None,
        }
    }
}

impl AnalysisOptions {
    /// Parses options from a list of strings.
    pub fn parse_from_args(&mut self, args: &[String]) {
        let matches = match make_options_parser().try_get_matches_from(args.iter()) {
            Ok(matches) => matches,
            Err(e) => {
                e.exit();
            }
        };

        if let Some(s) = matches.get_one::<String>("entry-func") {
            self.entry_func = s.clone();
        }
        self.no_spec = matches.contains_id("no-spec");
        self.no_opt = matches.contains_id("no-opt");

        if let Some(ids) = matches.get_many::<u32>("debug-id") {
            self.debug_ids = ids.copied().collect_vec();
        }
        if let Some(names) = matches.get_many::<String>("debug-fcn") {
            self.debug_fcn_names = names.cloned().collect_vec();
        }
        self.debug_global_name = matches.get_one::<String>("debug-glbl").cloned();

        self.do_spec_diff = matches.contains_id("do-spec-diff");
        self.do_check_dyn = matches.contains_id("do-check-dyn");
        self.dump_stats = matches.contains_id("dump-stats");
        self.pts_output = matches.get_one::<String>("pts-output").cloned();

        self.used_info_path = matches.get_one::<String>("used-info").cloned();
        self.indir_info_path = matches.get_one::<String>("indir-info").cloned();
        self.call_contexts_path = matches.get_one::<String>("call-contexts").cloned();
    }
}

#[cfg(test)]
mod test {
    use super::AnalysisOptions;

    fn parse(args: &[&str]) -> AnalysisOptions {
        let mut opts = AnalysisOptions::default();
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        opts.parse_from_args(&args);
        opts
    }

    #[test]
    fn defaults() {
        let opts = parse(&[]);
        assert_eq!(opts.entry_func, "main");
        assert!(!opts.no_spec);
        assert!(!opts.no_opt);
        assert!(opts.pts_output.is_none());
    }

    #[test]
    fn flags() {
        let opts = parse(&[
            "--no-spec",
            "--no-opt",
            "--entry-func",
            "start",
            "--debug-id",
            "12",
            "--debug-id",
            "17",
            "--dump-pts",
            "out.json",
        ]);
        assert!(opts.no_spec);
        assert!(opts.no_opt);
        assert_eq!(opts.entry_func, "start");
        assert_eq!(opts.debug_ids, vec![12, 17]);
        assert_eq!(opts.pts_output.as_deref(), Some("out.json"));
    }
}
