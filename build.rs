#[cfg(windows)]
use winres::WindowsResource;

fn main() {
    #[cfg(windows)]
    {
        let mut res = WindowsResource::new();
        res.set("ProductName", "gh-vault")
            .set("FileDescription", "GitHub repositories & gists backup");
        if let Err(err) = res.compile() {
            println!("cargo:warning=failed to embed Windows resources: {err}");
        }
    }
}
