// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! WKT codec for leaf payloads
//!
//! Leaf rows carry a single polygon, exchanged with the spatial database as
//! `POLYGON Z ((x y z, ...), (...))`. Parsing uses nom; 2D coordinates get
//! `z = 0` and an `SRID=n;` prefix (EWKT) is accepted and ignored.

use std::fmt::Write;

use nom::{
    bytes::complete::{tag_no_case, take_while},
    character::complete::{char, digit1, one_of},
    combinator::{all_consuming, map, map_res, opt, recognize},
    multi::separated_list1,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use crate::error::{Error, Result};
use crate::geometry::{Point, Polygon, Ring};

/// Skip whitespace
fn ws(input: &str) -> IResult<&str, ()> {
    map(take_while(|c: char| c.is_whitespace()), |_| ())(input)
}

/// Number: 12, -3.5, 1.5E-10, 4.
fn number(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize(tuple((
            opt(one_of("+-")),
            digit1,
            opt(pair(char('.'), opt(digit1))),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        |s: &str| s.parse::<f64>(),
    )(input)
}

/// Coordinate tuple, two or three ordinates
fn point(input: &str) -> IResult<&str, Point> {
    map(
        tuple((
            delimited(ws, number, ws),
            delimited(ws, number, ws),
            opt(delimited(ws, number, ws)),
        )),
        |(x, y, z)| [x, y, z.unwrap_or(0.0)],
    )(input)
}

fn ring(input: &str) -> IResult<&str, Ring> {
    delimited(
        pair(ws, char('(')),
        separated_list1(char(','), point),
        pair(char(')'), ws),
    )(input)
}

fn srid(input: &str) -> IResult<&str, &str> {
    delimited(tag_no_case("SRID="), digit1, char(';'))(input)
}

fn polygon(input: &str) -> IResult<&str, Polygon> {
    map(
        preceded(
            tuple((
                ws,
                opt(srid),
                ws,
                tag_no_case("POLYGON"),
                ws,
                opt(terminated(tag_no_case("Z"), ws)),
            )),
            delimited(char('('), separated_list1(char(','), ring), pair(char(')'), ws)),
        ),
        |mut rings| {
            let exterior = rings.remove(0);
            Polygon {
                exterior,
                interiors: rings,
            }
        },
    )(input)
}

/// Parse a WKT/EWKT polygon.
pub fn parse_polygon(input: &str) -> Result<Polygon> {
    match all_consuming(polygon)(input) {
        Ok((_, p)) => Ok(p),
        Err(e) => Err(Error::Wkt(format!("{}: {}", truncate(input), e))),
    }
}

fn truncate(input: &str) -> &str {
    match input.char_indices().nth(48) {
        Some((i, _)) => &input[..i],
        None => input,
    }
}

/// Format a polygon as `POLYGON Z (...)` using shortest round-trip floats.
pub fn format_polygon(polygon: &Polygon) -> String {
    let mut out = String::with_capacity(16 + polygon.exterior.len() * 24);
    out.push_str("POLYGON Z (");
    for (i, ring) in std::iter::once(&polygon.exterior)
        .chain(polygon.interiors.iter())
        .enumerate()
    {
        if i > 0 {
            out.push(',');
        }
        out.push('(');
        for (j, p) in ring.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            let _ = write!(out, "{} {} {}", p[0], p[1], p[2]);
        }
        out.push(')');
    }
    out.push(')');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number() {
        assert_eq!(number("42"), Ok(("", 42.0)));
        assert_eq!(number("-3.25 "), Ok((" ", -3.25)));
        assert_eq!(number("1.5E-10"), Ok(("", 1.5e-10)));
        assert_eq!(number("4."), Ok(("", 4.0)));
    }

    #[test]
    fn test_parse_polygon_with_hole() {
        let p = parse_polygon(
            "POLYGON Z ((0 0 1, 10 0 1, 10 10 1, 0 10 1, 0 0 1), (2 2 1, 4 2 1, 2 4 1, 2 2 1))",
        )
        .unwrap();
        assert_eq!(p.exterior.len(), 5);
        assert_eq!(p.exterior[1], [10.0, 0.0, 1.0]);
        assert_eq!(p.interiors.len(), 1);
        assert_eq!(p.interiors[0][2], [2.0, 4.0, 1.0]);
    }

    #[test]
    fn test_parse_ewkt_and_2d() {
        let p = parse_polygon("SRID=25832;POLYGON((0 0,1 0,1 1,0 0))").unwrap();
        assert_eq!(p.exterior[2], [1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_polygon("POINT (1 2 3)"), Err(Error::Wkt(_))));
        assert!(parse_polygon("POLYGON Z ((0 0 0, 1 1 1) trailing").is_err());
    }

    #[test]
    fn test_format_is_parseable() {
        let p = Polygon::new(vec![
            [0.1, 0.2, 0.3],
            [1.0 / 3.0, 2.5, -7.0],
            [1e-7, 123456.789, 0.0],
            [0.1, 0.2, 0.3],
        ]);
        let text = format_polygon(&p);
        assert!(text.starts_with("POLYGON Z ((0.1 0.2 0.3,"));
        assert_eq!(parse_polygon(&text).unwrap(), p);
    }
}
