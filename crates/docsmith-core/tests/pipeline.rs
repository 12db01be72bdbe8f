//! End-to-end pipeline tests against small shell scripts standing in for
//! the real converters. Every test checks that the artifact directory is
//! empty once the conversion is over, whichever way it ended.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use docsmith_core::{BinaryPaths, ConversionError, ConversionRequest, Converter, ConverterConfig, Route};
use tempfile::TempDir;

struct Harness {
    _root: TempDir,
    bin: PathBuf,
    work: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let work = root.path().join("work");
        Self {
            bin,
            work,
            _root: root,
        }
    }

    fn tool(&self, name: &str, body: &str) {
        let path = self.bin.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn converter(&self) -> Converter {
        Converter::new(ConverterConfig {
            temp_dir: self.work.clone(),
            binaries: BinaryPaths::all_in(&self.bin),
            tool_timeout: Duration::from_secs(10),
        })
    }

    fn leftovers(&self) -> Vec<PathBuf> {
        list(&self.work)
    }
}

fn list(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

const PDF: &[u8] = b"%PDF-1.4\n%fake\n";

/// Writes a two-page style document with a title and meta per page plus
/// one background image, the way `pdftohtml -c -s` does.
const FAKE_PDFTOHTML: &str = r#"for last; do :; done
base="${last%.html}"
name=$(basename "$base")
printf 'PNG' > "${base}001.png"
cat > "${base}-html.html" <<EOF
<!DOCTYPE html>
<html><head>
<title>Page 1</title>
<meta http-equiv="Content-Type" content="text/html; charset=UTF-8">
<meta name="generator" content="pdftohtml">
<style type="text/css">p {margin: 0;} div#page1-div {position:relative;}</style>
<title>Page 2</title>
<meta name="generator" content="pdftohtml">
</head><body><div id="page1-div"><img src="${name}001.png"><p>Itâ€™s here</p></div></body></html>
EOF
"#;

#[tokio::test]
async fn pdf_to_html_is_normalized_and_cleaned() {
    let h = Harness::new();
    h.tool("pdftohtml", FAKE_PDFTOHTML);

    let request = ConversionRequest::new(PDF).with_param("backgroundColor", "white");
    let result = h.converter().convert(Route::PdfToHtml, &request).await.unwrap();

    assert_eq!(result.content_type, "text/html; charset=utf-8");
    assert_eq!(result.body.matches("<title>").count(), 1);
    assert_eq!(result.body.matches("<meta").count(), 1);
    assert!(result.body.contains("Page 1"));
    assert!(result.body.contains("It\u{2019}s here"));
    assert!(result.body.contains("data:image/png;base64,UE5H"));
    assert!(result.body.contains("background-color:white"));
    assert!(h.leftovers().is_empty(), "{:?}", h.leftovers());
}

#[tokio::test]
async fn tool_receives_only_allow_listed_options() {
    let h = Harness::new();
    // Echo the arguments into the page so the test can see them
    h.tool(
        "pdftohtml",
        r#"for last; do :; done
echo "<html><head><title>t</title></head><body>$*</body></html>" > "${last%.html}-html.html"
"#,
    );

    let request = ConversionRequest::new(PDF)
        .with_param("foo", "bar")
        .with_param("zoom", "2")
        .with_param("ignoreImages", "true");
    let result = h.converter().convert(Route::PdfToHtml, &request).await.unwrap();

    assert!(result.body.contains("-c -s -i -enc UTF-8 -zoom 2 "));
    assert!(!result.body.contains("foo"));
    assert!(h.leftovers().is_empty());
}

#[tokio::test]
async fn syntax_error_is_client_error_and_cleaned() {
    let h = Harness::new();
    h.tool(
        "pdftohtml",
        r#"for last; do :; done
touch "${last%.html}-html.html" "${last%.html}001.png"
echo "Syntax Error: Couldn't find trailer dictionary" >&2
exit 1
"#,
    );

    let err = h
        .converter()
        .convert(Route::PdfToHtml, &ConversionRequest::new(PDF))
        .await
        .unwrap_err();

    assert!(err.is_client_error(), "{err}");
    assert!(h.leftovers().is_empty(), "{:?}", h.leftovers());
}

#[tokio::test]
async fn crash_is_environment_error() {
    let h = Harness::new();
    h.tool("pdftotext", "echo 'I/O Error: out of disk' >&2\nexit 3\n");

    let err = h
        .converter()
        .convert(Route::PdfToTxt, &ConversionRequest::new(PDF))
        .await
        .unwrap_err();

    assert!(matches!(err, ConversionError::Environment { .. }));
    assert!(h.leftovers().is_empty());
}

#[tokio::test]
async fn missing_binary_is_environment_error() {
    let h = Harness::new();

    let err = h
        .converter()
        .convert(Route::DocToTxt, &ConversionRequest::new(vec![0xd0, 0xcf, 0x11, 0xe0]))
        .await
        .unwrap_err();

    assert!(!err.is_client_error());
    assert!(err.to_string().contains("binary not found"));
    assert!(h.leftovers().is_empty());
}

#[tokio::test]
async fn aborted_conversion_leaves_nothing_behind() {
    let h = Harness::new();
    h.tool(
        "pdftohtml",
        r#"for last; do :; done
touch "${last%.html}-html.html"
sleep 30
"#,
    );

    let converter = h.converter();
    let request = ConversionRequest::new(PDF);
    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        converter.convert(Route::PdfToHtml, &request),
    )
    .await;

    assert!(outcome.is_err(), "conversion should still have been running");
    assert!(h.leftovers().is_empty(), "{:?}", h.leftovers());
}

#[tokio::test]
async fn pdf_to_txt_decodes_latin1() {
    let h = Harness::new();
    h.tool(
        "pdftotext",
        r#"for last; do :; done
printf 'caf\351\n' > "$last"
"#,
    );

    let request = ConversionRequest::new(PDF).with_param("outputEncoding", "Latin1");
    let result = h.converter().convert(Route::PdfToTxt, &request).await.unwrap();

    assert_eq!(result.body.trim(), "café");
    assert_eq!(result.content_type, "text/plain; charset=utf-8");
    assert!(h.leftovers().is_empty());
}

#[tokio::test]
async fn docx_to_html_embeds_extracted_media() {
    let h = Harness::new();
    h.tool(
        "pandoc",
        r#"for arg; do
  case "$arg" in
    --extract-media=*) media="${arg#--extract-media=}" ;;
  esac
done
mkdir -p "$media/media"
printf 'GIF' > "$media/media/image1.gif"
echo "<p>Hello <img src=\"$media/media/image1.gif\" /></p>"
"#,
    );

    let result = h
        .converter()
        .convert(Route::DocxToHtml, &ConversionRequest::new(b"PK\x03\x04".to_vec()))
        .await
        .unwrap();

    assert!(result.body.contains("<title>docsmith_docx-to-html_"));
    assert!(result.body.contains("Hello"));
    assert!(result.body.contains("data:image/gif;base64,R0lG"));
    assert!(h.leftovers().is_empty(), "{:?}", h.leftovers());
}

#[tokio::test]
async fn images_outside_the_request_are_not_embedded() {
    let h = Harness::new();
    std::fs::create_dir_all(&h.work).unwrap();
    let foreign = h.work.join("0123otherrequest.png");
    std::fs::write(&foreign, b"SECRET-OTHER-REQUEST").unwrap();
    h.tool(
        "pandoc",
        r#"echo '<p>Linked <img src="0123otherrequest.png" /></p>'
"#,
    );

    let result = h
        .converter()
        .convert(Route::DocxToHtml, &ConversionRequest::new(b"PK\x03\x04".to_vec()))
        .await
        .unwrap();

    // base64 of the foreign file's first bytes
    assert!(!result.body.contains("U0VDUkVU"), "{}", result.body);
    assert!(result.body.contains(r#"src="0123otherrequest.png""#));
    assert_eq!(h.leftovers(), vec![foreign]);
}

#[tokio::test]
async fn docx_container_error_is_client_error() {
    let h = Harness::new();
    h.tool(
        "pandoc",
        "echo \"couldn't unpack docx container: Did not find end of central directory signature\" >&2\nexit 64\n",
    );

    let err = h
        .converter()
        .convert(Route::DocxToTxt, &ConversionRequest::new(b"PK\x03\x04".to_vec()))
        .await
        .unwrap_err();

    assert!(err.is_client_error());
    assert!(h.leftovers().is_empty());
}

#[tokio::test]
async fn rtf_to_txt_strips_banner() {
    let h = Harness::new();
    h.tool(
        "unrtf",
        r#"echo '###  Translation from RTF performed by UnRTF, version 0.21.10 '
echo '### font table contains 1 fonts total'
echo '-----------------'
echo 'Hello from RTF'
"#,
    );

    let result = h
        .converter()
        .convert(Route::RtfToTxt, &ConversionRequest::new(br"{\rtf1 Hello}".to_vec()))
        .await
        .unwrap();

    assert_eq!(result.body, "Hello from RTF");
    assert!(h.leftovers().is_empty());
}

#[tokio::test]
async fn concurrent_conversions_do_not_collide() {
    let h = Harness::new();
    // Echo the payload back, so each request can recognise its own output
    h.tool("unrtf", "for last; do :; done\ncat \"$last\"\n");

    let converter = h.converter();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let converter = converter.clone();
        tasks.push(tokio::spawn(async move {
            let payload = format!("{{\\rtf1 document {i}}}");
            let request = ConversionRequest::new(payload.clone().into_bytes());
            let result = converter.convert(Route::RtfToTxt, &request).await.unwrap();
            assert_eq!(result.body, payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(h.leftovers().is_empty());
}
