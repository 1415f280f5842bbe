//! Plain-text generation data ("infotext").
//!
//! ```text
//! a lighthouse at dusk
//! Negative prompt: blurry
//! Steps: 20, CFG scale: 7, Seed: -1, Size: 512x512, Clip skip: 1
//! ```

use crate::payload::GenerationRequest;

const NEGATIVE_PREFIX: &str = "Negative prompt:";

impl GenerationRequest {
    /// Render the request as infotext.
    pub fn to_infotext(&self) -> String {
        let mut out = self.positive_prompt.clone();
        if !self.negative_prompt.is_empty() {
            out.push('\n');
            out.push_str(NEGATIVE_PREFIX);
            out.push(' ');
            out.push_str(&self.negative_prompt);
        }
        out.push('\n');
        out.push_str(&format!(
            "Steps: {}, CFG scale: {}, Seed: {}, Size: {}x{}, Clip skip: {}",
            self.sampling_steps, self.cfg_scale, self.seed, self.width, self.height, self.clip_skip
        ));
        if self.batch_count != 1.0 || self.batch_size != 1.0 {
            out.push_str(&format!(
                ", Batch count: {}, Batch size: {}",
                self.batch_count, self.batch_size
            ));
        }
        out
    }
}

/// Read infotext back into a request. Unknown keys are ignored and missing
/// ones keep their defaults.
pub fn parse_infotext(text: &str) -> GenerationRequest {
    let mut request = GenerationRequest::default();
    let lines: Vec<&str> = text.lines().collect();

    let params_index = lines
        .iter()
        .rposition(|line| line.trim_start().starts_with("Steps:"));
    let body = match params_index {
        Some(i) => &lines[..i],
        None => &lines[..],
    };

    let mut prompt = Vec::new();
    let mut negative = Vec::new();
    let mut in_negative = false;
    for line in body {
        if let Some(rest) = line.strip_prefix(NEGATIVE_PREFIX) {
            in_negative = true;
            negative.push(rest.trim_start());
        } else if in_negative {
            negative.push(line);
        } else {
            prompt.push(*line);
        }
    }
    request.positive_prompt = prompt.join("\n").trim().to_string();
    request.negative_prompt = negative.join("\n").trim().to_string();

    if let Some(i) = params_index {
        for field in lines[i].split(',') {
            let Some((key, value)) = field.split_once(':') else {
                continue;
            };
            apply_param(&mut request, key.trim(), value.trim());
        }
    }

    request
}

fn apply_param(request: &mut GenerationRequest, key: &str, value: &str) {
    let number = || value.parse::<f64>().ok();
    match key {
        "Steps" => request.sampling_steps = number().unwrap_or(request.sampling_steps),
        "CFG scale" => request.cfg_scale = number().unwrap_or(request.cfg_scale),
        "Seed" => request.seed = value.parse().unwrap_or(request.seed),
        "Clip skip" => request.clip_skip = number().unwrap_or(request.clip_skip),
        "Batch count" => request.batch_count = number().unwrap_or(request.batch_count),
        "Batch size" => request.batch_size = number().unwrap_or(request.batch_size),
        "Size" => {
            if let Some((w, h)) = value.split_once('x') {
                if let (Ok(w), Ok(h)) = (w.trim().parse(), h.trim().parse()) {
                    request.width = w;
                    request.height = h;
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let request = GenerationRequest::new("a lighthouse at dusk")
            .negative("blurry")
            .size(512.0, 768.0)
            .cfg_scale(7.5)
            .seed(42);

        assert_eq!(
            request.to_infotext(),
            "a lighthouse at dusk\nNegative prompt: blurry\n\
             Steps: 20, CFG scale: 7.5, Seed: 42, Size: 512x768, Clip skip: 1"
        );
    }

    #[test]
    fn test_parse_a1111_output() {
        let text = "portrait of a cat, oil painting\n\
                    wearing a hat\n\
                    Negative prompt: lowres, bad anatomy\n\
                    Steps: 28, Sampler: DPM++ 2M Karras, CFG scale: 6, Seed: 1234, Size: 640x832, Model hash: 6ce0161689, Clip skip: 2";

        let request = parse_infotext(text);
        assert_eq!(request.positive_prompt, "portrait of a cat, oil painting\nwearing a hat");
        assert_eq!(request.negative_prompt, "lowres, bad anatomy");
        assert_eq!(request.sampling_steps, 28.0);
        assert_eq!(request.cfg_scale, 6.0);
        assert_eq!(request.seed, 1234);
        assert_eq!((request.width, request.height), (640.0, 832.0));
        assert_eq!(request.clip_skip, 2.0);
    }

    #[test]
    fn test_parse_prompt_only() {
        let request = parse_infotext("just a prompt");
        assert_eq!(request.positive_prompt, "just a prompt");
        assert_eq!(request.negative_prompt, "");
        assert_eq!(request.seed, -1);
        assert_eq!(request.width, 512.0);
    }

    #[test]
    fn test_render_then_parse_keeps_batch() {
        let request = GenerationRequest::new("x").batch(2.0, 4.0);
        let parsed = parse_infotext(&request.to_infotext());
        assert_eq!(parsed, request);
    }
}
