//! HTML templates for the OAuth web authentication flow

/// Authentication method selection page (GET /v0/oauth/kiro)
pub const SELECT_PAGE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Kiro Authentication</title>
<meta name="viewport" content="width=device-width, initial-scale=1">
<style>
body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif; max-width: 480px; margin: 80px auto; color: #1a1a1a; }
h1 { font-size: 1.3rem; }
button, a.button { display: inline-block; width: 100%; padding: 12px; margin: 8px 0; border: 1px solid #ccc; border-radius: 6px; background: #fafafa; text-align: center; text-decoration: none; color: inherit; cursor: pointer; font-size: 1rem; }
button:hover, a.button:hover { background: #f0f0f0; }
form { margin-top: 24px; }
input { width: 100%; padding: 8px; margin: 6px 0; box-sizing: border-box; }
</style>
</head>
<body>
<h1>Sign in with Kiro</h1>
<p>Choose an authentication method:</p>
<a class="button" href="/v0/oauth/kiro/start?method=builder-id">Builder ID</a>
<form action="/v0/oauth/kiro/start" method="get">
<input type="hidden" name="method" value="idc">
<label for="startUrl">IdC Start URL</label>
<input type="text" id="startUrl" name="startUrl" placeholder="https://my-org.awsapps.com/start">
<label for="region">Region</label>
<input type="text" id="region" name="region" value="us-east-1">
<button type="submit">Sign in with IdC</button>
</form>
</body>
</html>"#;

/// Device authorization page shown once the device flow has started
pub fn render_start_page(auth_url: &str, user_code: &str, expires_in: i64, state_id: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Kiro Authentication</title>
<meta name="viewport" content="width=device-width, initial-scale=1">
<style>
body {{ font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif; max-width: 480px; margin: 80px auto; color: #1a1a1a; text-align: center; }}
.code {{ font-size: 1.8rem; letter-spacing: 2px; font-weight: 600; margin: 24px 0; }}
a.button {{ display: inline-block; padding: 12px 24px; border-radius: 6px; background: #1a1a1a; color: #fff; text-decoration: none; }}
#status {{ margin-top: 24px; color: #666; }}
</style>
</head>
<body>
<h1>Complete sign-in</h1>
<p>Enter this code when prompted, or continue in the opened window:</p>
<div class="code">{user_code}</div>
<p><a class="button" href="{auth_url}" target="_blank" rel="noopener">Open authorization page</a></p>
<p id="status">Waiting for confirmation&hellip; (expires in {expires_in}s)</p>
<script>
const stateId = {state_id:?};
async function poll() {{
  try {{
    const res = await fetch(`/v0/oauth/kiro/status?state=${{stateId}}`);
    if (res.ok) {{
      const body = await res.json();
      if (body.status === "completed") {{
        document.getElementById("status").textContent = "Signed in successfully. You may close this window.";
        return;
      }}
      if (body.status === "failed") {{
        document.getElementById("status").textContent = "Authentication failed: " + (body.error || "unknown error");
        return;
      }}
    }}
  }} catch (e) {{
    // transient network errors are retried on the next tick
  }}
  setTimeout(poll, 3000);
}}
poll();
</script>
</body>
</html>"#,
        user_code = user_code,
        auth_url = auth_url,
        expires_in = expires_in,
        state_id = state_id,
    )
}

/// Error page shown when authentication setup fails
pub fn render_error_page(error: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Authentication Error</title>
<meta name="viewport" content="width=device-width, initial-scale=1">
<style>
body {{ font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif; max-width: 480px; margin: 80px auto; color: #1a1a1a; }}
.error {{ color: #b00020; background: #fdecea; border-radius: 6px; padding: 12px; }}
</style>
</head>
<body>
<h1>Authentication failed</h1>
<p class="error">{error}</p>
<p><a href="/v0/oauth/kiro">Try again</a></p>
</body>
</html>"#,
        error = html_escape(error),
    )
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
