// Copyright (C) 2023 QuerentAI LLC.
// This file is part of Querent.

// The Licensed Work is licensed under the Business Source License 1.1 (BSL 1.1).
// You may use this file in compliance with the BSL 1.1, subject to the following restrictions:
// 1. You may not use the Licensed Work for AI-related services, database services,
//    or any service or product offering that provides database, big data, or analytics
//    services to third parties unless explicitly authorized by QuerentAI LLC.
// 2. For more details, see the LICENSE file or visit https://mariadb.com/bsl11/.

// For inquiries about alternative licensing arrangements, please contact contact@querent.xyz.

// The Licensed Work is provided "AS IS", WITHOUT WARRANTY OF ANY KIND, express or implied,
// including but not limited to the warranties of merchantability, fitness for a particular purpose,
// and non-infringement. See the Business Source License for more details.

// This software includes code developed by QuerentAI LLC (https://querent.xyz).

use rand::{distributions::Alphanumeric, prelude::*};

const ADJECTIVES: &[&str] = &[
	"amber",
	"autumn",
	"billowing",
	"bold",
	"broken",
	"cold",
	"crimson",
	"damp",
	"dawn",
	"divine",
	"empty",
	"falling",
	"frosty",
	"green",
	"hidden",
	"icy",
	"late",
	"lingering",
	"misty",
	"morning",
	"nameless",
	"patient",
	"polished",
	"quiet",
	"restless",
	"silent",
	"snowy",
	"solitary",
	"sparkling",
	"twilight",
	"wandering",
	"weathered",
];

const NOUNS: &[&str] = &[
	"breeze",
	"brook",
	"cloud",
	"dew",
	"dust",
	"feather",
	"field",
	"fire",
	"firefly",
	"flower",
	"fog",
	"forest",
	"frog",
	"frost",
	"glade",
	"glitter",
	"grass",
	"haze",
	"hill",
	"lake",
	"leaf",
	"meadow",
	"moon",
	"mountain",
	"night",
	"pine",
	"rain",
	"river",
	"sea",
	"shadow",
	"silence",
	"smoke",
	"snow",
	"sound",
	"star",
	"stream",
	"sun",
	"surf",
	"thunder",
	"violet",
	"water",
	"wave",
	"wind",
	"wood",
];

/// Generates a short human-readable unique id such as
/// `exec-misty-brook-Tv3k`.
///
/// Uniqueness is probabilistic, which is plenty for correlating log
/// lines and events within a process.
pub fn new_quid(prefix: &str) -> String {
	let mut rng = rand::thread_rng();
	let adjective = ADJECTIVES.choose(&mut rng).unwrap();
	let noun = NOUNS.choose(&mut rng).unwrap();
	let suffix: String =
		rng.sample_iter(&Alphanumeric).take(4).map(char::from).collect();
	format!("{prefix}-{adjective}-{noun}-{suffix}")
}
