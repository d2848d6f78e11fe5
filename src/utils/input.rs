use crate::error::ClientError;
use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};

fn prompt_line<R: BufRead, W: Write>(reader: &mut R, writer: &mut W, message: &str) -> Result<String> {
    loop {
        write!(writer, "{}", message).context("Failed to write prompt")?;
        writer.flush().context("Failed to flush stdout")?;

        let mut user_input = String::new();
        let read = reader
            .read_line(&mut user_input)
            .context("Failed to read line")?;
        if read == 0 {
            anyhow::bail!("Input closed before a value was entered");
        }

        let trimmed = user_input.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
        writeln!(writer, "Value cannot be empty. Please try again.").context("Failed to write prompt")?;
    }
}

fn read_api_key<R: BufRead, W: Write>(reader: &mut R, writer: &mut W) -> Result<String> {
    prompt_line(reader, writer, "Please enter your API key: ").map_err(|e| {
        ClientError::Configuration(format!("no API key provided: {:#}", e)).into()
    })
}

pub fn input_api_key() -> Result<String> {
    read_api_key(&mut io::stdin().lock(), &mut io::stdout())
}

pub fn input_class_name() -> Result<String> {
    prompt_line(
        &mut io::stdin().lock(),
        &mut io::stdout(),
        "Please enter your class name (i.e. person, dog, cat): ",
    )
}
