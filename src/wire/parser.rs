//! Tokenizes one already-CRLF-stripped command line into a [`Command`].
//! Everything here is synchronous, allocation-light, and has no knowledge
//! of connection or engine state — [`super::decoder::Decoder`] is the only
//! caller, via `cmd.as_ref().try_into()?` on the line it has just split off
//! the front of the stream.

use super::protocol::{Command, Response};

/// Tube names longer than this, or containing characters outside the
/// allowed set, are rejected with `BAD_FORMAT`.
const MAX_TUBE_LEN: usize = 200;

impl TryFrom<&[u8]> for Command {
    type Error = Response;

    fn try_from(line: &[u8]) -> Result<Self, Self::Error> {
        let mut parts = line.split(|&b| b == b' ').filter(|s| !s.is_empty());
        let verb = parts.next().ok_or(Response::UnknownCommand)?;

        let cmd = match verb {
            b"put" => Command::Put {
                pri: next_u32(&mut parts)?,
                delay: next_u32(&mut parts)?,
                ttr: next_u32(&mut parts)?,
                n_bytes: next_u32(&mut parts)?,
            },
            b"reserve" => Command::Reserve,
            b"reserve-with-timeout" => Command::ReserveWithTimeout {
                timeout: next_u32(&mut parts)?,
            },
            b"reserve-job" => Command::ReserveJob { id: next_u64(&mut parts)? },
            b"release" => Command::Release {
                id: next_u64(&mut parts)?,
                pri: next_u32(&mut parts)?,
                delay: next_u32(&mut parts)?,
            },
            b"delete" => Command::Delete { id: next_u64(&mut parts)? },
            b"bury" => Command::Bury {
                id: next_u64(&mut parts)?,
                pri: next_u32(&mut parts)?,
            },
            b"touch" => Command::Touch { id: next_u64(&mut parts)? },
            b"watch" => Command::Watch { tube: next_tube(&mut parts)? },
            b"ignore" => Command::Ignore { tube: next_tube(&mut parts)? },
            b"peek" => Command::Peek { id: next_u64(&mut parts)? },
            b"peek-ready" => Command::PeekReady,
            b"peek-delayed" => Command::PeekDelayed,
            b"peek-buried" => Command::PeekBuried,
            b"kick" => Command::Kick { bound: next_u64(&mut parts)? },
            b"kick-job" => Command::KickJob { id: next_u64(&mut parts)? },
            b"stats-job" => Command::StatsJob { id: next_u64(&mut parts)? },
            b"stats-tube" => Command::StatsTube { tube: next_tube(&mut parts)? },
            b"stats" => Command::StatsServer,
            b"list-tubes" => Command::ListTubes,
            b"list-tube-used" => Command::ListTubeUsed,
            b"list-tubes-watched" => Command::ListTubesWatched,
            b"quit" => Command::Quit,
            b"pause-tube" => Command::PauseTube {
                tube: next_tube(&mut parts)?,
                delay: next_u32(&mut parts)?,
            },
            b"use" => Command::Use { tube: next_tube(&mut parts)? },
            _ => return Err(Response::UnknownCommand),
        };

        no_more(&mut parts)?;
        Ok(cmd)
    }
}

fn next_u32<'a>(parts: &mut impl Iterator<Item = &'a [u8]>) -> Result<u32, Response> {
    parse_token(parts)
}

fn next_u64<'a>(parts: &mut impl Iterator<Item = &'a [u8]>) -> Result<u64, Response> {
    parse_token(parts)
}

fn parse_token<'a, T: std::str::FromStr>(parts: &mut impl Iterator<Item = &'a [u8]>) -> Result<T, Response> {
    let token = parts.next().ok_or(Response::BadFormat)?;
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Response::BadFormat)
}

fn next_tube<'a>(parts: &mut impl Iterator<Item = &'a [u8]>) -> Result<Vec<u8>, Response> {
    let token = parts.next().ok_or(Response::BadFormat)?;
    validate_tube_name(token)?;
    Ok(token.to_vec())
}

fn no_more<'a>(parts: &mut impl Iterator<Item = &'a [u8]>) -> Result<(), Response> {
    match parts.next() {
        Some(_) => Err(Response::BadFormat),
        None => Ok(()),
    }
}

/// Beanstalkd's tube-name charset: alphanumerics plus a handful of
/// punctuation characters, never starting with `-`.
fn validate_tube_name(name: &[u8]) -> Result<(), Response> {
    if name.is_empty() || name.len() > MAX_TUBE_LEN || name[0] == b'-' {
        return Err(Response::BadFormat);
    }
    let allowed = |b: u8| {
        b.is_ascii_alphanumeric() || matches!(b, b'-' | b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')')
    };
    if !name.iter().all(|&b| allowed(b)) {
        return Err(Response::BadFormat);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Command, Response> {
        Command::try_from(line.as_bytes())
    }

    #[test]
    fn parses_put() {
        assert_eq!(
            parse("put 10 0 60 5").unwrap(),
            Command::Put { pri: 10, delay: 0, ttr: 60, n_bytes: 5 }
        );
    }

    #[test]
    fn rejects_non_numeric_argument() {
        assert_eq!(parse("put abc 0 60 5"), Err(Response::BadFormat));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert_eq!(parse("reserve now"), Err(Response::BadFormat));
    }

    #[test]
    fn unknown_verb_is_unknown_command() {
        assert_eq!(parse("frobnicate"), Err(Response::UnknownCommand));
    }

    #[test]
    fn rejects_oversized_tube_name() {
        let long = "a".repeat(MAX_TUBE_LEN + 1);
        assert_eq!(parse(&format!("use {long}")), Err(Response::BadFormat));
    }

    #[test]
    fn rejects_tube_name_starting_with_hyphen() {
        assert_eq!(parse("use -bad"), Err(Response::BadFormat));
    }

    #[test]
    fn accepts_tube_name_with_allowed_punctuation() {
        assert_eq!(
            parse("use my-tube.1_2").unwrap(),
            Command::Use { tube: b"my-tube.1_2".to_vec() }
        );
    }

    #[test]
    fn parses_quit_and_stats() {
        assert_eq!(parse("quit").unwrap(), Command::Quit);
        assert_eq!(parse("stats").unwrap(), Command::StatsServer);
        assert_eq!(parse("list-tubes").unwrap(), Command::ListTubes);
    }
}
