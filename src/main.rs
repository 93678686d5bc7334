// Copyright 2025 node-provisioner Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;

use libnodeprov::agent;
use libnodeprov::cmdline::AgentOpts;

fn main() {
    let opts = AgentOpts::parse();

    // On success run() never returns; the process becomes the handoff script.
    let err = match agent::run(&opts) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    eprintln!("Error: {err:#}");
    eprintln!("Dropping to emergency shell");
    match agent::emergency_shell() {
        Ok(never) => match never {},
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    }
}
