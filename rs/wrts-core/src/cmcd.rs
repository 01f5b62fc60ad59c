//! Common Media Client Data (CMCD): request-time metrics sent to the server
//! either as a single `cmcd=` query parameter or as CMCD headers.

use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
	Audio,
	Video,
	Other,
}

impl ObjectType {
	fn as_str(self) -> &'static str {
		match self {
			ObjectType::Audio => "a",
			ObjectType::Video => "v",
			ObjectType::Other => "o",
		}
	}
}

/// One request's worth of CMCD fields. `full` additionally emits `cid`,
/// `dl`, `ot`, `st=l`, `v=1`.
#[derive(Debug, Clone)]
pub struct Cmcd {
	pub session_id: String,
	pub bitrate_kbps: Option<u64>,
	pub buffer_length_ms: Option<u64>,
	pub buffer_starvation: bool,
	pub measured_throughput_kbps: Option<u64>,
	pub playback_rate: f64,
	pub buffer_empty: bool,
	pub full: bool,
	pub content_id: Option<String>,
	pub deadline_ms: Option<u64>,
	pub object_type: Option<ObjectType>,
}

impl Cmcd {
	pub fn new(session_id: impl Into<String>) -> Self {
		Self {
			session_id: session_id.into(),
			bitrate_kbps: None,
			buffer_length_ms: None,
			buffer_starvation: false,
			measured_throughput_kbps: None,
			playback_rate: 1.0,
			buffer_empty: false,
			full: false,
			content_id: None,
			deadline_ms: None,
			object_type: None,
		}
	}

	/// Build the CMCD fields as `key=value` pairs, comma-joined per the CMCD
	/// spec's textual encoding (used both for the `cmcd=` query value and for
	/// the `CMCD-*` header bodies).
	fn fields(&self) -> Vec<String> {
		let mut fields = Vec::new();

		if let Some(br) = self.bitrate_kbps {
			fields.push(format!("br={br}"));
		}
		if let Some(bl) = self.buffer_length_ms {
			fields.push(format!("bl={bl}"));
		}
		if self.buffer_starvation {
			fields.push("bs".to_string());
		}
		if let Some(mtp) = self.measured_throughput_kbps {
			fields.push(format!("mtp={mtp}"));
		}
		if self.playback_rate != 1.0 {
			fields.push(format!("pr={}", trim_float(self.playback_rate)));
		}
		fields.push("sf=o".to_string());
		fields.push(format!("sid=\"{}\"", self.session_id));
		if self.buffer_empty {
			fields.push("su".to_string());
		}

		if self.full {
			if let Some(cid) = &self.content_id {
				fields.push(format!("cid=\"{cid}\""));
			}
			if let Some(dl) = self.deadline_ms {
				fields.push(format!("dl={dl}"));
			}
			if let Some(ot) = self.object_type {
				fields.push(format!("ot={}", ot.as_str()));
			}
			fields.push("st=l".to_string());
			fields.push("v=1".to_string());
		}

		fields.sort();
		fields
	}

	/// Encode as the value of a single `cmcd=` query parameter.
	pub fn to_query_value(&self) -> String {
		let mut out = String::new();
		for (i, field) in self.fields().into_iter().enumerate() {
			if i > 0 {
				out.push(',');
			}
			let _ = write!(out, "{field}");
		}
		out
	}

	/// Encode as `CMCD-Request`/`CMCD-Object`/`CMCD-Session`/`CMCD-Status`
	/// header values is out of scope here; most deployments accept the whole
	/// payload on a single `CMCD-Object` header, which this returns.
	pub fn to_header_value(&self) -> String {
		self.to_query_value()
	}
}

fn trim_float(v: f64) -> String {
	let mut s = format!("{v:.2}");
	while s.ends_with('0') {
		s.pop();
	}
	if s.ends_with('.') {
		s.pop();
	}
	s
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn short_mode_omits_full_only_fields() {
		let mut cmcd = Cmcd::new("abc");
		cmcd.bitrate_kbps = Some(800);
		cmcd.buffer_length_ms = Some(1200);
		let encoded = cmcd.to_query_value();
		assert!(encoded.contains("br=800"));
		assert!(encoded.contains("bl=1200"));
		assert!(encoded.contains("sid=\"abc\""));
		assert!(!encoded.contains("v=1"));
	}

	#[test]
	fn full_mode_adds_content_and_object_fields() {
		let mut cmcd = Cmcd::new("abc");
		cmcd.full = true;
		cmcd.content_id = Some("stream-1".to_string());
		cmcd.object_type = Some(ObjectType::Video);
		let encoded = cmcd.to_query_value();
		assert!(encoded.contains("cid=\"stream-1\""));
		assert!(encoded.contains("ot=v"));
		assert!(encoded.contains("st=l"));
		assert!(encoded.contains("v=1"));
	}

	#[test]
	fn buffer_starvation_and_empty_flags_are_bare_keys() {
		let mut cmcd = Cmcd::new("abc");
		cmcd.buffer_starvation = true;
		cmcd.buffer_empty = true;
		let encoded = cmcd.to_query_value();
		assert!(encoded.split(',').any(|f| f == "bs"));
		assert!(encoded.split(',').any(|f| f == "su"));
	}
}
