// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Decide whether the invocation carries stdin worth relaying.
//!
//! A terminal means "no stdin"; an empty regular file (the usual shape of an
//! inherited but unused descriptor) is also skipped so the server can close
//! the stdin pipe straight away. Pipes and non-empty files are relayed.

use std::io::IsTerminal;

pub fn stdin_is_readable() -> bool {
    if std::io::stdin().is_terminal() {
        return false;
    }
    #[cfg(unix)]
    {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(0, &mut stat) } == 0 {
            let mode = stat.st_mode & libc::S_IFMT;
            if mode == libc::S_IFREG && stat.st_size == 0 {
                return false;
            }
        }
    }
    true
}
