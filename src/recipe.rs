// Copyright 2019 CoreOS, Inc.
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

//! The recipe DSL: a line-oriented instruction list describing how to turn
//! a bare disk into a booted system.
//!
//! Each line is a keyword followed by double-quoted arguments, with an
//! optional bare `TO` token dropped as syntactic sugar (`COPY "img" TO
//! "vol:/path"` reads the same as `COPY "img" "vol:/path"`). Blank lines and
//! lines starting with `#` are ignored. Instructions this core doesn't
//! recognize are kept as [`Instruction::Opaque`] rather than rejected, so a
//! recipe written against a newer instruction set still compiles as far as
//! the instructions this core understands.

use std::fmt;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Clone an image directly onto a volume's backing partition. `image`
    /// may name a single-partition image, or, for a multi-partition image,
    /// be qualified as `image:image_volume` to select which partition
    /// inside the image gets cloned.
    Deploy {
        image: String,
        image_volume: Option<String>,
        volume: String,
    },
    /// Fetch an image into the local cache without deploying it anywhere.
    Pull { image: String },
    /// Copy a single file out of an image onto a mounted volume.
    Copy {
        image: String,
        volume: String,
        path: String,
    },
    /// Extract an archive image onto a mounted volume.
    Unpack {
        image: String,
        volume: String,
        path: String,
    },
    /// Create a filesystem on a volume's backing partition.
    Format { volume: String, fstype: String },
    /// An instruction this core doesn't know the semantics of. Carried
    /// through unchanged so a recipe can mix in keywords understood by a
    /// later version of the core without failing to parse.
    Opaque { keyword: String, args: Vec<String> },
}

impl Instruction {
    pub fn image(&self) -> Option<&str> {
        match self {
            Instruction::Deploy { image, .. }
            | Instruction::Pull { image }
            | Instruction::Copy { image, .. }
            | Instruction::Unpack { image, .. } => Some(image),
            Instruction::Format { .. } | Instruction::Opaque { .. } => None,
        }
    }

    pub fn volume(&self) -> Option<&str> {
        match self {
            Instruction::Deploy { volume, .. }
            | Instruction::Copy { volume, .. }
            | Instruction::Unpack { volume, .. }
            | Instruction::Format { volume, .. } => Some(volume),
            Instruction::Pull { .. } | Instruction::Opaque { .. } => None,
        }
    }

    fn from_parts(line: usize, keyword: &str, args: Vec<String>) -> Result<Instruction> {
        match keyword {
            "DEPLOY" => {
                let [source, volume] = take2(line, "DEPLOY", args)?;
                require_nonempty(line, "source image", &source)?;
                require_nonempty(line, "target volume", &volume)?;
                let (image, image_volume) = split_source(line, &source)?;
                Ok(Instruction::Deploy { image, image_volume, volume })
            }
            "PULL" => {
                let image = take1(line, "PULL", args)?;
                require_nonempty(line, "source image", &image)?;
                Ok(Instruction::Pull { image })
            }
            "COPY" => {
                let [image, target] = take2(line, "COPY", args)?;
                require_nonempty(line, "source image", &image)?;
                let (volume, path) = split_target(line, &target)?;
                Ok(Instruction::Copy { image, volume, path })
            }
            "UNPACK" => {
                let [image, target] = take2(line, "UNPACK", args)?;
                require_nonempty(line, "source image", &image)?;
                let (volume, path) = split_target(line, &target)?;
                Ok(Instruction::Unpack { image, volume, path })
            }
            "FORMAT" => {
                let [volume, fstype] = take2(line, "FORMAT", args)?;
                require_nonempty(line, "target volume", &volume)?;
                require_nonempty(line, "filesystem type", &fstype)?;
                Ok(Instruction::Format { volume, fstype })
            }
            other => Ok(Instruction::Opaque {
                keyword: other.to_string(),
                args,
            }),
        }
    }
}

fn take1(line: usize, keyword: &str, mut args: Vec<String>) -> Result<String> {
    if args.len() != 1 {
        return Err(Error::Parse {
            line,
            message: format!(
                "invalid {keyword} instruction: {} params, expected 1",
                args.len()
            ),
        });
    }
    Ok(args.remove(0))
}

fn take2(line: usize, keyword: &str, args: Vec<String>) -> Result<[String; 2]> {
    if args.len() != 2 {
        return Err(Error::Parse {
            line,
            message: format!(
                "invalid {keyword} instruction: {} params, expected 2",
                args.len()
            ),
        });
    }
    let mut it = args.into_iter();
    Ok([it.next().unwrap(), it.next().unwrap()])
}

fn require_nonempty(line: usize, what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Parse {
            line,
            message: format!("invalid {what} definition"),
        });
    }
    Ok(())
}

/// Splits a `DEPLOY` source of the form `image` or `image:image_volume`,
/// where `image_volume` selects one partition out of a multi-partition
/// image.
fn split_source(line: usize, source: &str) -> Result<(String, Option<String>)> {
    let mut parts = source.splitn(2, ':');
    let image = parts.next().unwrap_or("").trim().to_string();
    require_nonempty(line, "source image", &image)?;
    let image_volume = match parts.next() {
        Some(p) if !p.trim().is_empty() => Some(p.trim().to_string()),
        _ => None,
    };
    Ok((image, image_volume))
}

/// Splits a `COPY`/`UNPACK` target of the form `volume` or `volume:/path`.
/// An empty or absent path defaults to `/`.
fn split_target(line: usize, target: &str) -> Result<(String, String)> {
    let mut parts = target.splitn(2, ':');
    let volume = parts.next().unwrap_or("").trim().to_string();
    require_nonempty(line, "target volume", &volume)?;
    let path = match parts.next() {
        Some(p) if !p.trim().is_empty() => p.trim().to_string(),
        _ => "/".to_string(),
    };
    Ok((volume, path))
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (keyword, args): (&str, Vec<String>) = match self {
            Instruction::Deploy { image, image_volume, volume } => {
                let source = match image_volume {
                    Some(iv) => format!("{image}:{iv}"),
                    None => image.clone(),
                };
                ("DEPLOY", vec![source, volume.clone()])
            }
            Instruction::Pull { image } => ("PULL", vec![image.clone()]),
            Instruction::Copy { image, volume, path } => {
                ("COPY", vec![image.clone(), format!("{volume}:{path}")])
            }
            Instruction::Unpack { image, volume, path } => {
                ("UNPACK", vec![image.clone(), format!("{volume}:{path}")])
            }
            Instruction::Format { volume, fstype } => {
                ("FORMAT", vec![volume.clone(), fstype.clone()])
            }
            Instruction::Opaque { keyword, args } => (keyword.as_str(), args.clone()),
        };
        write!(f, "{keyword}")?;
        for arg in args {
            write!(f, " \"{arg}\"")?;
        }
        Ok(())
    }
}

/// An ordered, parsed recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipe {
    pub instructions: Vec<Instruction>,
}

impl Recipe {
    pub fn parse(source: &str) -> Result<Recipe> {
        let mut instructions = Vec::new();
        for (idx, raw_line) in source.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (keyword, rest) = match line.split_once(char::is_whitespace) {
                Some((k, r)) => (k, r),
                None => (line, ""),
            };
            let args = tokenize(rest);
            instructions.push(Instruction::from_parts(line_no, &keyword.to_uppercase(), args)?);
        }
        Ok(Recipe { instructions })
    }

    pub fn required_images(&self) -> Vec<&str> {
        self.instructions.iter().filter_map(Instruction::image).collect()
    }

    pub fn required_volumes(&self) -> Vec<&str> {
        self.instructions.iter().filter_map(Instruction::volume).collect()
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, instr) in self.instructions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{instr}")?;
        }
        Ok(())
    }
}

/// Splits a line into double-quote-aware tokens, then drops a bare `TO`
/// token anywhere it appears (pure syntactic sugar: `DEPLOY "a" TO "b"`
/// means the same as `DEPLOY "a" "b"`).
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for c in s.chars() {
        match c {
            ' ' | '\t' if !in_quote => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            '"' => in_quote = !in_quote,
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens.retain(|t| t != "TO");
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_known_instructions() {
        let src = r#"
            # a comment
            PULL "base.img"
            DEPLOY "base.img" "root"
            COPY "base.img" "root:/etc/motd"
            UNPACK "overlay.tar.gz" TO "root:/opt"
            FORMAT "data" "ext4"
        "#;
        let recipe = Recipe::parse(src).unwrap();
        assert_eq!(recipe.instructions.len(), 5);
        assert_eq!(
            recipe.instructions[0],
            Instruction::Pull { image: "base.img".into() }
        );
        assert_eq!(
            recipe.instructions[3],
            Instruction::Unpack {
                image: "overlay.tar.gz".into(),
                volume: "root".into(),
                path: "/opt".into(),
            }
        );
    }

    #[test]
    fn copy_without_path_defaults_to_root() {
        let recipe = Recipe::parse(r#"COPY "base.img" "root""#).unwrap();
        assert_eq!(
            recipe.instructions[0],
            Instruction::Copy {
                image: "base.img".into(),
                volume: "root".into(),
                path: "/".into(),
            }
        );
    }

    #[test]
    fn unknown_instruction_is_opaque() {
        let recipe = Recipe::parse(r#"REBOOT "now""#).unwrap();
        assert_eq!(
            recipe.instructions[0],
            Instruction::Opaque {
                keyword: "REBOOT".into(),
                args: vec!["now".into()],
            }
        );
    }

    #[test]
    fn wrong_arity_reports_line_number() {
        let src = "DEPLOY \"only-one\"\n";
        let err = Recipe::parse(src).unwrap_err();
        match err {
            Error::Parse { line, .. } => assert_eq!(line, 1),
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn empty_source_image_is_rejected() {
        let err = Recipe::parse(r#"PULL """#).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn required_images_and_volumes() {
        let src = r#"
            PULL "a.img"
            DEPLOY "a.img" "root"
            FORMAT "data" "ext4"
        "#;
        let recipe = Recipe::parse(src).unwrap();
        assert_eq!(recipe.required_images(), vec!["a.img", "a.img"]);
        assert_eq!(recipe.required_volumes(), vec!["root", "data"]);
    }

    #[test]
    fn render_round_trips_through_display() {
        let src = r#"DEPLOY "base.img" "root""#;
        let recipe = Recipe::parse(src).unwrap();
        assert_eq!(recipe.to_string(), r#"DEPLOY "base.img" "root""#);
    }

    #[test]
    fn deploy_selects_a_partition_inside_a_multi_part_image() {
        let src = "DEPLOY win:sda1 TO system\nCOPY driver.zip system:/drivers\nFORMAT scratch ext4";
        let recipe = Recipe::parse(src).unwrap();
        assert_eq!(
            recipe.instructions[0],
            Instruction::Deploy {
                image: "win".into(),
                image_volume: Some("sda1".into()),
                volume: "system".into(),
            }
        );
        assert_eq!(
            recipe.instructions[1],
            Instruction::Copy {
                image: "driver.zip".into(),
                volume: "system".into(),
                path: "/drivers".into(),
            }
        );
        assert_eq!(
            recipe.instructions[2],
            Instruction::Format { volume: "scratch".into(), fstype: "ext4".into() }
        );
    }

    #[test]
    fn deploy_render_round_trips_image_volume_qualifier() {
        let src = r#"DEPLOY "win:sda1" "system""#;
        let recipe = Recipe::parse(src).unwrap();
        assert_eq!(recipe.to_string(), src);
    }
}
